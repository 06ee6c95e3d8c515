use std::{
    iter::FusedIterator,
    path::{Path, PathBuf},
};

use serde::Serialize;

use crate::error::Result;
use crate::fs::{CgroupFs, DirEntry, FileType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalkOrder {
    /// Parents before their children.
    #[default]
    PreOrder,
    /// Children before their parents.
    PostOrder,
}

/// One node visited by a tree walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub file_type: FileType,
    /// Name of the entry.
    pub path: String,
    /// Name of the directory holding the entry.
    pub parent: String,
    pub full_path: PathBuf,
    /// Distance from the walk base, which is at depth 0.
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    /// Children are on the stack above the frame.
    Expanded,
    /// Reported without descending into it.
    Leaf,
}

#[derive(Debug)]
struct Frame {
    info: FileInfo,
    visit: Visit,
}

/// Cursor over a directory tree below a hierarchy. Siblings are visited in
/// name order. Errors reading a directory are yielded and the walk goes on
/// with the next entry.
pub struct TreeWalk<'a, F: CgroupFs> {
    fs: &'a F,
    order: WalkOrder,
    max_depth: usize,
    stack: Vec<Frame>,
}

impl<'a, F: CgroupFs> TreeWalk<'a, F> {
    /// Starts a walk at `base`. A `max_depth` of 0 walks the whole tree.
    pub fn new(fs: &'a F, base: &Path, max_depth: usize, order: WalkOrder) -> Result<Self> {
        let metadata = fs.metadata(base)?;
        let name = |p: Option<&Path>| {
            p.and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        let root = FileInfo {
            file_type: metadata.file_type,
            path: name(Some(base)),
            parent: name(base.parent()),
            full_path: base.to_path_buf(),
            depth: 0,
        };

        Ok(Self {
            fs,
            order,
            max_depth,
            stack: vec![Frame {
                info: root,
                visit: Visit::Pending,
            }],
        })
    }

    pub fn order(&self) -> WalkOrder {
        self.order
    }

    /// Ends the walk early.
    pub fn close(self) {}

    fn can_descend(&self, info: &FileInfo) -> bool {
        info.file_type == FileType::Dir && (self.max_depth == 0 || info.depth < self.max_depth)
    }

    fn children(&self, info: &FileInfo) -> Result<Vec<Frame>> {
        let entries: Vec<DirEntry> = self.fs.read_dir(&info.full_path)?;
        // reversed so that popping the stack yields them in name order
        Ok(entries
            .into_iter()
            .rev()
            .map(|entry| Frame {
                info: FileInfo {
                    file_type: entry.file_type,
                    full_path: info.full_path.join(&entry.name),
                    path: entry.name,
                    parent: info.path.clone(),
                    depth: info.depth + 1,
                },
                visit: Visit::Pending,
            })
            .collect())
    }
}

impl<'a, F: CgroupFs> Iterator for TreeWalk<'a, F> {
    type Item = Result<FileInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut frame = self.stack.pop()?;
            match frame.visit {
                Visit::Expanded if self.order == WalkOrder::PreOrder => continue,
                Visit::Expanded | Visit::Leaf => return Some(Ok(frame.info)),
                Visit::Pending if !self.can_descend(&frame.info) => {
                    return Some(Ok(frame.info))
                }
                Visit::Pending => {}
            }

            let children = match self.children(&frame.info) {
                Ok(children) => children,
                Err(err) => {
                    // the entry itself is still reported, without its children
                    frame.visit = Visit::Leaf;
                    self.stack.push(frame);
                    return Some(Err(err));
                }
            };
            frame.visit = Visit::Expanded;
            let info = frame.info.clone();
            self.stack.push(frame);
            self.stack.extend(children);
            if self.order == WalkOrder::PreOrder {
                return Some(Ok(info));
            }
        }
    }
}

impl<'a, F: CgroupFs> FusedIterator for TreeWalk<'a, F> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fs::FakeCgroupFs;

    fn tree() -> FakeCgroupFs {
        let fs = FakeCgroupFs::new();
        fs.add_dir_all("/cg/a/b");
        fs.add_dir_all("/cg/c");
        fs.set_file("/cg/tasks", "");
        fs.set_file("/cg/a/tasks", "");
        fs
    }

    fn names(walk: TreeWalk<'_, FakeCgroupFs>) -> Vec<(String, usize)> {
        walk.map(|info| {
            let info = info.unwrap();
            (info.path, info.depth)
        })
        .collect()
    }

    #[test]
    fn test_pre_order() {
        let fs = tree();
        let walk = TreeWalk::new(&fs, Path::new("/cg"), 0, WalkOrder::PreOrder).unwrap();
        assert_eq!(
            names(walk),
            vec![
                ("cg".to_owned(), 0),
                ("a".to_owned(), 1),
                ("b".to_owned(), 2),
                ("tasks".to_owned(), 2),
                ("c".to_owned(), 1),
                ("tasks".to_owned(), 1),
            ]
        );
    }

    #[test]
    fn test_post_order() {
        let fs = tree();
        let walk = TreeWalk::new(&fs, Path::new("/cg"), 0, WalkOrder::PostOrder).unwrap();
        assert_eq!(
            names(walk),
            vec![
                ("b".to_owned(), 2),
                ("tasks".to_owned(), 2),
                ("a".to_owned(), 1),
                ("c".to_owned(), 1),
                ("tasks".to_owned(), 1),
                ("cg".to_owned(), 0),
            ]
        );
    }

    #[test]
    fn test_depth_limit() {
        let fs = tree();
        let walk = TreeWalk::new(&fs, Path::new("/cg"), 1, WalkOrder::PreOrder).unwrap();
        let visited: Vec<String> = names(walk).into_iter().map(|(n, _)| n).collect();
        assert_eq!(visited, vec!["cg", "a", "c", "tasks"]);
    }

    #[test]
    fn test_file_info_fields() {
        let fs = tree();
        let mut walk = TreeWalk::new(&fs, Path::new("/cg/a"), 0, WalkOrder::PreOrder).unwrap();
        let base = walk.next().unwrap().unwrap();
        assert_eq!(base.file_type, FileType::Dir);
        assert_eq!(base.parent, "cg");

        let child = walk.next().unwrap().unwrap();
        assert_eq!(child.path, "b");
        assert_eq!(child.parent, "a");
        assert_eq!(child.full_path, PathBuf::from("/cg/a/b"));
        walk.close();
    }

    #[test]
    fn test_exhausted_walk_stays_exhausted() {
        let fs = tree();
        let mut walk = TreeWalk::new(&fs, Path::new("/cg/c"), 0, WalkOrder::PostOrder).unwrap();
        assert_eq!(walk.next().unwrap().unwrap().path, "c");
        assert!(walk.next().is_none());
        assert!(walk.next().is_none());
    }

    #[test]
    fn test_missing_base() {
        let fs = tree();
        assert!(TreeWalk::new(&fs, Path::new("/cg/missing"), 0, WalkOrder::PreOrder).is_err());
    }
}
