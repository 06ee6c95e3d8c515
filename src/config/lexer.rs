use super::ParseError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word(String),
    Quoted(String),
    LBrace,
    RBrace,
    Equals,
    Semicolon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '{' | '}' | '=' | ';' | '"' | '#')
}

/// Splits configuration text into tokens. `#` starts a comment running to
/// the end of the line; quoted strings may span lines and know the `\"`,
/// `\\`, `\n` and `\t` escapes.
pub fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        let kind = match c {
            '\n' => {
                line += 1;
                continue;
            }
            c if c.is_whitespace() => continue,
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
                continue;
            }
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            '=' => TokenKind::Equals,
            ';' => TokenKind::Semicolon,
            '"' => {
                let start = line;
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(ParseError::new(start, "\"", "unterminated string"));
                        }
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some('\n') => line += 1,
                            Some(other) => value.push(other),
                            None => {
                                return Err(ParseError::new(start, "\"", "unterminated string"));
                            }
                        },
                        Some(c) => {
                            if c == '\n' {
                                line += 1;
                            }
                            value.push(c);
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Quoted(value),
                    line: start,
                });
                continue;
            }
            c => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                TokenKind::Word(word)
            }
        };
        tokens.push(Token { kind, line });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_tokenize_assignment() {
        assert_eq!(
            kinds("cpu.shares = \"512\";"),
            vec![
                TokenKind::Word("cpu.shares".to_owned()),
                TokenKind::Equals,
                TokenKind::Quoted("512".to_owned()),
                TokenKind::Semicolon,
            ]
        );
    }

    #[test]
    fn test_tokenize_paths_and_braces() {
        assert_eq!(
            kinds("mount{cpu=/sys/fs/cgroup/cpu,cpuacct;}"),
            vec![
                TokenKind::Word("mount".to_owned()),
                TokenKind::LBrace,
                TokenKind::Word("cpu".to_owned()),
                TokenKind::Equals,
                TokenKind::Word("/sys/fs/cgroup/cpu,cpuacct".to_owned()),
                TokenKind::Semicolon,
                TokenKind::RBrace,
            ]
        );
    }

    #[test]
    fn test_comments_and_lines() {
        let tokens = tokenize("# header\ngroup a { # trailing\n}\n").unwrap();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0].line, 2);
        assert_eq!(tokens[3].line, 3);
    }

    #[test]
    fn test_quoted_escapes() {
        assert_eq!(
            kinds(r#""a \"b\"\n""#),
            vec![TokenKind::Quoted("a \"b\"\n".to_owned())]
        );

        let tokens = tokenize("\"0-1\n2\" x").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("group a {\n cpu.shares = \"512;\n}").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
