use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use crate::error::{Error, Pool};

/// How deep a [`Path`] reaches into the object tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
  /// `/` — the whole tree
  Root,
  /// `/obj`
  Object,
  /// `/obj/inst`
  ObjectInstance,
  /// `/obj/inst/res`
  Resource,
  /// `/obj/inst/res/res-inst`
  ResourceInstance,
}

impl Level {
  /// Number of meaningful path segments (0..=4)
  pub fn depth(&self) -> u8 {
    match self {
      | Level::Root => 0,
      | Level::Object => 1,
      | Level::ObjectInstance => 2,
      | Level::Resource => 3,
      | Level::ResourceInstance => 4,
    }
  }

  pub(crate) fn from_depth(depth: u8) -> Option<Level> {
    match depth {
      | 0 => Some(Level::Root),
      | 1 => Some(Level::Object),
      | 2 => Some(Level::ObjectInstance),
      | 3 => Some(Level::Resource),
      | 4 => Some(Level::ResourceInstance),
      | _ => None,
    }
  }
}

/// An address in the LwM2M object tree.
///
/// Fields beyond [`Path::level`] are always zero; the constructors and the
/// string parser maintain this, which is what lets `PartialEq` compare all
/// fields blindly.
///
/// ```
/// use toad_lwm2m::path::{Level, Path};
///
/// let p: Path = "/3/0/9".parse().unwrap();
/// assert_eq!(p, Path::resource(3, 0, 9));
/// assert_eq!(p.level, Level::Resource);
/// assert_eq!(p.to_string(), "/3/0/9");
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Path {
  /// object id
  pub obj: u16,
  /// object instance id (meaningful from [`Level::ObjectInstance`])
  pub obj_inst: u16,
  /// resource id (meaningful from [`Level::Resource`])
  pub res: u16,
  /// resource instance id (meaningful at [`Level::ResourceInstance`])
  pub res_inst: u16,
  /// how many of the fields above mean anything
  pub level: Level,
}

impl Default for Level {
  fn default() -> Self {
    Level::Root
  }
}

impl Path {
  /// `/`
  pub const fn root() -> Self {
    Path { obj: 0,
           obj_inst: 0,
           res: 0,
           res_inst: 0,
           level: Level::Root }
  }

  /// `/obj`
  pub const fn object(obj: u16) -> Self {
    Path { obj,
           obj_inst: 0,
           res: 0,
           res_inst: 0,
           level: Level::Object }
  }

  /// `/obj/inst`
  pub const fn instance(obj: u16, obj_inst: u16) -> Self {
    Path { obj,
           obj_inst,
           res: 0,
           res_inst: 0,
           level: Level::ObjectInstance }
  }

  /// `/obj/inst/res`
  pub const fn resource(obj: u16, obj_inst: u16, res: u16) -> Self {
    Path { obj,
           obj_inst,
           res,
           res_inst: 0,
           level: Level::Resource }
  }

  /// `/obj/inst/res/res-inst`
  pub const fn resource_instance(obj: u16, obj_inst: u16, res: u16, res_inst: u16) -> Self {
    Path { obj,
           obj_inst,
           res,
           res_inst,
           level: Level::ResourceInstance }
  }

  /// The path one level up, `None` at the root.
  pub fn parent(&self) -> Option<Path> {
    let mut up = *self;
    up.level = Level::from_depth(self.level.depth().checked_sub(1)?)?;
    match up.level {
      | Level::Root => up.obj = 0,
      | Level::Object => up.obj_inst = 0,
      | Level::ObjectInstance => up.res = 0,
      | Level::Resource => up.res_inst = 0,
      | Level::ResourceInstance => {},
    }
    Some(up)
  }

  /// Is `self` the same path as `other`, or an ancestor of it?
  ///
  /// ```
  /// use toad_lwm2m::path::Path;
  ///
  /// assert!(Path::object(3).is_prefix_of(&Path::resource(3, 0, 9)));
  /// assert!(Path::object(3).is_prefix_of(&Path::object(3)));
  /// assert!(!Path::instance(3, 1).is_prefix_of(&Path::resource(3, 0, 9)));
  /// ```
  pub fn is_prefix_of(&self, other: &Path) -> bool {
    if self.level.depth() > other.level.depth() {
      return false;
    }

    (self.level < Level::Object || self.obj == other.obj)
    && (self.level < Level::ObjectInstance || self.obj_inst == other.obj_inst)
    && (self.level < Level::Resource || self.res == other.res)
    && (self.level < Level::ResourceInstance || self.res_inst == other.res_inst)
  }

  /// Level-prefix-aware overlap, the matching rule observers use: the two
  /// paths agree on every level both of them have.
  ///
  /// An observer on `/3` overlaps a change at `/3/0/1`, and an observer on
  /// `/3/0/1` overlaps a wholesale change at `/3`.
  pub fn overlaps(&self, other: &Path) -> bool {
    self.is_prefix_of(other) || other.is_prefix_of(self)
  }

  fn sort_key(&self) -> (Option<u16>, Option<u16>, Option<u16>, Option<u16>) {
    let d = self.level.depth();
    ((d >= 1).then(|| self.obj),
     (d >= 2).then(|| self.obj_inst),
     (d >= 3).then(|| self.res),
     (d >= 4).then(|| self.res_inst))
  }
}

impl PartialOrd for Path {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

/// Objects ascend by id, then instances, then resources, then resource
/// instances; a shallower path sorts before any deeper path sharing its
/// prefix.
impl Ord for Path {
  fn cmp(&self, other: &Self) -> Ordering {
    self.sort_key().cmp(&other.sort_key())
  }
}

impl fmt::Display for Path {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let d = self.level.depth();
    if d == 0 {
      return write!(f, "/");
    }

    write!(f, "/{}", self.obj)?;
    if d >= 2 {
      write!(f, "/{}", self.obj_inst)?;
    }
    if d >= 3 {
      write!(f, "/{}", self.res)?;
    }
    if d >= 4 {
      write!(f, "/{}", self.res_inst)?;
    }
    Ok(())
  }
}

impl FromStr for Path {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let trimmed = s.strip_prefix('/').unwrap_or(s);
    if trimmed.is_empty() {
      return Ok(Path::root());
    }

    let mut ids = [0u16; 4];
    let mut depth = 0u8;
    for seg in trimmed.split('/') {
      if depth == 4 {
        return Err(Error::Invalid);
      }

      ids[depth as usize] = seg.parse::<u16>().map_err(|_| Error::Invalid)?;
      depth += 1;
    }

    let mut path = Path { obj: ids[0],
                          obj_inst: ids[1],
                          res: ids[2],
                          res_inst: ids[3],
                          level: Level::from_depth(depth).ok_or(Error::Invalid)? };

    // zero the tail so equality stays field-blind
    if depth < 4 {
      path.res_inst = 0;
    }
    if depth < 3 {
      path.res = 0;
    }
    if depth < 2 {
      path.obj_inst = 0;
    }
    if depth < 1 {
      path.obj = 0;
    }

    Ok(path)
  }
}

/// A sorted, duplicate-collapsed list of paths with a fixed capacity.
///
/// This is the shape observers and composite operations carry their targets
/// in. Inserting a path whose prefix is already present is a no-op;
/// inserting a prefix of existing entries absorbs them; inserting the root
/// clears everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathList {
  entries: Vec<Path>,
  capacity: usize,
}

impl PathList {
  /// An empty list that can hold up to `capacity` paths.
  pub fn new(capacity: usize) -> Self {
    PathList { entries: Vec::with_capacity(capacity),
               capacity }
  }

  /// The 1-entry list a classic (non-composite) observation uses.
  pub fn single(path: Path) -> Self {
    PathList { entries: vec![path],
               capacity: 1 }
  }

  /// Insert, keeping the list sorted and collapsed.
  pub fn insert(&mut self, path: Path) -> Result<(), Error> {
    if self.entries.iter().any(|e| e.is_prefix_of(&path)) {
      return Ok(());
    }

    self.entries.retain(|e| !path.is_prefix_of(e));

    if self.entries.len() == self.capacity {
      return Err(Error::NoMem(Pool::PathList));
    }

    let at = self.entries
                 .binary_search(&path)
                 .unwrap_or_else(|missing_at| missing_at);
    self.entries.insert(at, path);
    Ok(())
  }

  /// Iterate in sorted order.
  pub fn iter(&self) -> core::slice::Iter<'_, Path> {
    self.entries.iter()
  }

  /// The first (shallowest/lowest) path.
  pub fn first(&self) -> Option<&Path> {
    self.entries.first()
  }

  #[allow(missing_docs)]
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  #[allow(missing_docs)]
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Does any entry overlap `changed`?
  pub fn matches(&self, changed: &Path) -> bool {
    self.entries.iter().any(|e| e.overlaps(changed))
  }

  /// Drop every entry under `prefix`, reporting whether anything was
  /// removed.
  pub fn remove_subtree(&mut self, prefix: &Path) -> bool {
    let before = self.entries.len();
    self.entries.retain(|e| !prefix.is_prefix_of(e));
    before != self.entries.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_and_render() {
    assert_eq!("/".parse::<Path>().unwrap(), Path::root());
    assert_eq!("3".parse::<Path>().unwrap(), Path::object(3));
    assert_eq!("/3/0".parse::<Path>().unwrap(), Path::instance(3, 0));
    assert_eq!("/3/0/9".parse::<Path>().unwrap(), Path::resource(3, 0, 9));
    assert_eq!("/19/0/0/2".parse::<Path>().unwrap(),
               Path::resource_instance(19, 0, 0, 2));

    assert_eq!(Path::resource(3303, 0, 5700).to_string(), "/3303/0/5700");
    assert_eq!(Path::root().to_string(), "/");
  }

  #[test]
  fn parse_rejects_junk() {
    assert!("/a/b".parse::<Path>().is_err());
    assert!("/1/2/3/4/5".parse::<Path>().is_err());
    assert!("/70000".parse::<Path>().is_err());
  }

  #[test]
  fn ordering_puts_shallow_before_deep() {
    let mut v = vec![Path::resource(3, 0, 9),
                     Path::object(3),
                     Path::instance(1, 0),
                     Path::instance(3, 0),
                     Path::resource_instance(3, 0, 9, 1),
                     Path::object(5)];
    v.sort();
    assert_eq!(v,
               vec![Path::instance(1, 0),
                    Path::object(3),
                    Path::instance(3, 0),
                    Path::resource(3, 0, 9),
                    Path::resource_instance(3, 0, 9, 1),
                    Path::object(5)]);
  }

  #[test]
  fn overlap_is_prefix_aware_both_ways() {
    let shallow = Path::object(3);
    let deep = Path::resource(3, 0, 1);
    assert!(shallow.overlaps(&deep));
    assert!(deep.overlaps(&shallow));
    assert!(!Path::object(4).overlaps(&deep));
    assert!(!Path::resource(3, 0, 2).overlaps(&deep));
    assert!(Path::root().overlaps(&deep));
  }

  #[test]
  fn list_insert_collapses_any_permutation() {
    let paths = [Path::resource(3, 0, 9),
                 Path::object(3),
                 Path::instance(4, 0),
                 Path::resource(4, 0, 1),
                 Path::instance(3, 1)];

    // every insertion order lands on the same collapsed, sorted list
    let mut orders: Vec<Vec<usize>> = vec![];
    permutations(&mut (0..paths.len()).collect::<Vec<_>>(), 0, &mut orders);

    for order in orders {
      let mut list = PathList::new(8);
      for i in order {
        list.insert(paths[i]).unwrap();
      }

      let got: Vec<Path> = list.iter().copied().collect();
      assert_eq!(got,
                 vec![Path::object(3), Path::instance(4, 0)],
                 "paths under /3 and /4/0 must collapse");
    }
  }

  fn permutations(items: &mut Vec<usize>, k: usize, out: &mut Vec<Vec<usize>>) {
    if k == items.len() {
      out.push(items.clone());
      return;
    }

    for i in k..items.len() {
      items.swap(k, i);
      permutations(items, k + 1, out);
      items.swap(k, i);
    }
  }

  #[test]
  fn list_root_swallows_everything() {
    let mut list = PathList::new(4);
    list.insert(Path::resource(3, 0, 9)).unwrap();
    list.insert(Path::root()).unwrap();
    list.insert(Path::object(5)).unwrap();

    let got: Vec<Path> = list.iter().copied().collect();
    assert_eq!(got, vec![Path::root()]);
  }

  #[test]
  fn list_respects_capacity() {
    let mut list = PathList::new(2);
    list.insert(Path::object(1)).unwrap();
    list.insert(Path::object(2)).unwrap();
    assert_eq!(list.insert(Path::object(3)),
               Err(Error::NoMem(Pool::PathList)));
    // a collapse does not count against capacity
    list.insert(Path::instance(1, 0)).unwrap();
    assert_eq!(list.len(), 2);
  }
}
