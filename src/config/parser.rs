use std::path::PathBuf;

use super::lexer::{tokenize, Token, TokenKind};
use super::ParseError;

/// Key of the unified hierarchy in a `mount` block.
pub const UNIFIED_MOUNT_KEY: &str = "cgroup2";

/// A parsed cgconfig.conf file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub mounts: Vec<MountDirective>,
    pub default_perm: Option<PermSpec>,
    pub groups: Vec<GroupDef>,
}

/// `controller = path;` inside a `mount` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountDirective {
    pub controller: String,
    pub path: PathBuf,
    pub line: usize,
}

/// A user or group, by id or by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Id(u32),
    Name(String),
}

impl Principal {
    fn parse(value: &str) -> Self {
        match value.parse::<u32>() {
            Ok(id) => Principal::Id(id),
            Err(_) => Principal::Name(value.to_owned()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPerm {
    pub uid: Option<Principal>,
    pub gid: Option<Principal>,
    pub fperm: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminPerm {
    pub uid: Option<Principal>,
    pub gid: Option<Principal>,
    pub dperm: Option<u32>,
    pub fperm: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermSpec {
    pub task: TaskPerm,
    pub admin: AdminPerm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDef {
    pub name: String,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDef {
    pub name: String,
    pub line: usize,
    pub perm: Option<PermSpec>,
    pub controllers: Vec<ControllerDef>,
}

pub fn parse(text: &str) -> Result<Config, ParseError> {
    let tokens = tokenize(text)?;
    Parser {
        tokens,
        position: 0,
    }
    .config()
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn line(&self) -> usize {
        self.peek()
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn next(&mut self, field: &str) -> Result<Token, ParseError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or_else(|| ParseError::new(self.line(), field, "unexpected end of file"))?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, kind: TokenKind, field: &str) -> Result<(), ParseError> {
        let token = self.next(field)?;
        if token.kind != kind {
            return Err(ParseError::new(
                token.line,
                field,
                format!("expected {kind:?}, found {:?}", token.kind),
            ));
        }
        Ok(())
    }

    /// A bare word or a quoted string.
    fn value(&mut self, field: &str) -> Result<(String, usize), ParseError> {
        let token = self.next(field)?;
        match token.kind {
            TokenKind::Word(value) | TokenKind::Quoted(value) => Ok((value, token.line)),
            other => Err(ParseError::new(
                token.line,
                field,
                format!("expected a value, found {other:?}"),
            )),
        }
    }

    /// Consumes the closing brace of a block if it comes next.
    fn close_block(&mut self) -> bool {
        if matches!(self.peek(), Some(Token { kind: TokenKind::RBrace, .. })) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    /// `key = value;` pairs up to the closing brace.
    fn assignments(&mut self, block: &str) -> Result<Vec<(String, String, usize)>, ParseError> {
        let mut assignments: Vec<(String, String, usize)> = Vec::new();
        while !self.close_block() {
            let (key, line) = self.value(block)?;
            self.expect(TokenKind::Equals, &key)?;
            let (value, _) = self.value(&key)?;
            self.expect(TokenKind::Semicolon, &key)?;
            if assignments.iter().any(|(k, _, _)| k == &key) {
                return Err(ParseError::new(line, &key, "duplicate parameter"));
            }
            assignments.push((key, value, line));
        }
        Ok(assignments)
    }

    fn config(mut self) -> Result<Config, ParseError> {
        let mut config = Config::default();
        while self.peek().is_some() {
            let (keyword, line) = self.value("configuration")?;
            match keyword.as_str() {
                "mount" => self.mount(&mut config)?,
                "group" => {
                    let group = self.group(line)?;
                    if config.groups.iter().any(|g| g.name == group.name) {
                        return Err(ParseError::new(line, &group.name, "duplicate group"));
                    }
                    config.groups.push(group);
                }
                "default" => {
                    if config.default_perm.is_some() {
                        return Err(ParseError::new(line, "default", "duplicate default block"));
                    }
                    self.expect(TokenKind::LBrace, "default")?;
                    let mut perm = None;
                    while !self.close_block() {
                        let (key, line) = self.value("default")?;
                        if key != "perm" || perm.is_some() {
                            return Err(ParseError::new(line, &key, "expected a single perm block"));
                        }
                        perm = Some(self.perm()?);
                    }
                    config.default_perm = Some(perm.unwrap_or_default());
                }
                "template" | "namespace" => {
                    return Err(ParseError::new(line, &keyword, "unsupported directive"));
                }
                _ => return Err(ParseError::new(line, &keyword, "unknown directive")),
            }
        }
        Ok(config)
    }

    fn mount(&mut self, config: &mut Config) -> Result<(), ParseError> {
        self.expect(TokenKind::LBrace, "mount")?;
        for (controller, path, line) in self.assignments("mount")? {
            if controller.contains('=') {
                return Err(ParseError::new(
                    line,
                    &controller,
                    "named hierarchies are not supported",
                ));
            }
            if config.mounts.iter().any(|m| m.controller == controller) {
                return Err(ParseError::new(line, &controller, "duplicate mount"));
            }
            if !path.starts_with('/') {
                return Err(ParseError::new(line, &controller, "mount point must be absolute"));
            }
            config.mounts.push(MountDirective {
                controller,
                path: PathBuf::from(path),
                line,
            });
        }
        Ok(())
    }

    fn group(&mut self, line: usize) -> Result<GroupDef, ParseError> {
        let (name, _) = self.value("group")?;
        self.expect(TokenKind::LBrace, &name)?;

        let mut group = GroupDef {
            name,
            line,
            perm: None,
            controllers: Vec::new(),
        };
        while !self.close_block() {
            let (key, key_line) = self.value(&group.name)?;
            if key == "perm" {
                if group.perm.is_some() {
                    return Err(ParseError::new(key_line, "perm", "duplicate perm block"));
                }
                group.perm = Some(self.perm()?);
                continue;
            }

            if group.controllers.iter().any(|c| c.name == key) {
                return Err(ParseError::new(key_line, &key, "duplicate controller"));
            }
            self.expect(TokenKind::LBrace, &key)?;
            let params = self
                .assignments(&key)?
                .into_iter()
                .map(|(param, value, _)| (param, value))
                .collect();
            group.controllers.push(ControllerDef { name: key, params });
        }

        if group.controllers.is_empty() {
            return Err(ParseError::new(line, &group.name, "group has no controllers"));
        }
        Ok(group)
    }

    fn perm(&mut self) -> Result<PermSpec, ParseError> {
        self.expect(TokenKind::LBrace, "perm")?;
        let mut perm = PermSpec::default();
        while !self.close_block() {
            let (section, line) = self.value("perm")?;
            self.expect(TokenKind::LBrace, &section)?;
            let assignments = self.assignments(&section)?;
            match section.as_str() {
                "task" => {
                    for (key, value, line) in assignments {
                        match key.as_str() {
                            "uid" => perm.task.uid = Some(Principal::parse(&value)),
                            "gid" => perm.task.gid = Some(Principal::parse(&value)),
                            "fperm" => perm.task.fperm = Some(parse_mode(&value, &key, line)?),
                            _ => return Err(ParseError::new(line, &key, "unknown task key")),
                        }
                    }
                }
                "admin" => {
                    for (key, value, line) in assignments {
                        match key.as_str() {
                            "uid" => perm.admin.uid = Some(Principal::parse(&value)),
                            "gid" => perm.admin.gid = Some(Principal::parse(&value)),
                            "dperm" => perm.admin.dperm = Some(parse_mode(&value, &key, line)?),
                            "fperm" => perm.admin.fperm = Some(parse_mode(&value, &key, line)?),
                            _ => return Err(ParseError::new(line, &key, "unknown admin key")),
                        }
                    }
                }
                _ => return Err(ParseError::new(line, &section, "unknown perm section")),
            }
        }
        Ok(perm)
    }
}

fn parse_mode(value: &str, field: &str, line: usize) -> Result<u32, ParseError> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| ParseError::new(line, field, format!("invalid mode {value:?}")))
}
