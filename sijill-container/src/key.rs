//! Type tags.
//!
//! [`TypeTag`] identifies a produced type or a declared capability
//! (usually a `dyn Trait`). It is what `find_by_type` matches against
//! and what event listeners filter on.

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

use sijill_support::rendering::short_type_name;

/// Identifies a Rust type inside the container.
///
/// Equality and hashing use only the [`TypeId`]; the name is kept for
/// error messages.
///
/// # Examples
/// ```
/// use sijill_container::key::TypeTag;
///
/// let tag = TypeTag::of::<String>();
/// assert_eq!(tag.type_name(), "alloc::string::String");
/// assert_eq!(tag.short_name(), "String");
///
/// trait Clock {}
/// let _dyn_tag = TypeTag::of::<dyn Clock>();
/// ```
#[derive(Clone, Copy)]
pub struct TypeTag {
    type_id: TypeId,
    type_name: &'static str,
}

impl TypeTag {
    /// Creates a tag for type `T`.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
        }
    }

    /// Returns the [`TypeId`] of this tag.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the fully qualified type name.
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the type name without module paths.
    pub fn short_name(&self) -> String {
        short_type_name(self.type_name)
    }
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for TypeTag {}

impl Hash for TypeTag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", self.type_name)
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Invoice;

    #[test]
    fn tag_of_type() {
        let tag = TypeTag::of::<Invoice>();
        assert!(tag.type_name().ends_with("Invoice"));
        assert_eq!(tag.to_string(), "Invoice");
    }

    #[test]
    fn equality_ignores_nothing_but_type() {
        assert_eq!(TypeTag::of::<String>(), TypeTag::of::<String>());
        assert_ne!(TypeTag::of::<String>(), TypeTag::of::<i32>());
    }

    #[test]
    fn dyn_trait_differs_from_impl() {
        trait Clock {}
        struct Wall;
        impl Clock for Wall {}
        assert_ne!(TypeTag::of::<dyn Clock>(), TypeTag::of::<Wall>());
    }

    #[test]
    fn usable_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(TypeTag::of::<String>(), "string");
        assert_eq!(map.get(&TypeTag::of::<String>()), Some(&"string"));
        assert_eq!(map.get(&TypeTag::of::<bool>()), None);
    }
}
