//! Cheap-to-clone interned-ish strings, used anywhere a small string is
//! cloned across tasks (tracking ids, addresses, target names).

pub type Strng = arcstr::ArcStr;

pub fn new(s: impl AsRef<str>) -> Strng {
	arcstr::ArcStr::from(s.as_ref())
}
