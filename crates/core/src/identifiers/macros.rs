/// Generates the borrowed/owned pair for a string identifier.
///
/// The borrowed type is an unsized `str` wrapper; the owned type wraps a
/// `Box<str>` and derefs to the borrowed type. Both validate through the
/// given function on construction from untrusted input.
macro_rules! opaque_identifier {
    (
        $(#[doc = $doc:literal])*
        pub type $id:ident, $owned:ident, $validate:path;
    ) => {
        $(#[doc = $doc])*
        #[repr(transparent)]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id(str);

        $(#[doc = $doc])*
        ///
        /// Owned variant.
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $owned(Box<str>);

        impl $id {
            pub(super) fn from_borrowed(s: &str) -> &Self {
                // SAFETY: repr(transparent) over str
                unsafe { &*(s as *const str as *const Self) }
            }

            /// Parses `s`, validating it.
            pub fn parse(s: &str) -> Result<&Self, $crate::identifiers::IdParseError> {
                $validate(s)?;
                Ok(Self::from_borrowed(s))
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The identifier as bytes.
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl $owned {
            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $owned {
            type Target = $id;

            fn deref(&self) -> &$id {
                $id::from_borrowed(&self.0)
            }
        }

        impl std::borrow::Borrow<$id> for $owned {
            fn borrow(&self) -> &$id {
                self
            }
        }

        impl std::borrow::Borrow<str> for $owned {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<$id> for $owned {
            fn as_ref(&self) -> &$id {
                self
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $owned {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl ToOwned for $id {
            type Owned = $owned;

            fn to_owned(&self) -> $owned {
                $owned(self.0.into())
            }
        }

        impl From<&$id> for $owned {
            fn from(id: &$id) -> Self {
                id.to_owned()
            }
        }

        impl<'a> TryFrom<&'a str> for &'a $id {
            type Error = $crate::identifiers::IdParseError;

            fn try_from(s: &'a str) -> Result<Self, Self::Error> {
                $id::parse(s)
            }
        }

        impl TryFrom<&str> for $owned {
            type Error = $crate::identifiers::IdParseError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $id::parse(s).map(ToOwned::to_owned)
            }
        }

        impl TryFrom<String> for $owned {
            type Error = $crate::identifiers::IdParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                $validate(&s)?;
                Ok(Self(s.into_boxed_str()))
            }
        }

        impl std::str::FromStr for $owned {
            type Err = $crate::identifiers::IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.try_into()
            }
        }

        impl std::fmt::Display for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Display for $owned {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::fmt::Debug for $id {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                $crate::identifiers::debug_id(stringify!($id), &self.0, f)
            }
        }

        impl std::fmt::Debug for $owned {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                $crate::identifiers::debug_id(stringify!($owned), &self.0, f)
            }
        }

        impl PartialEq<str> for $id {
            fn eq(&self, other: &str) -> bool {
                &self.0 == other
            }
        }

        impl PartialEq<&str> for $id {
            fn eq(&self, other: &&str) -> bool {
                &self.0 == *other
            }
        }

        impl PartialEq<str> for $owned {
            fn eq(&self, other: &str) -> bool {
                &*self.0 == other
            }
        }

        impl PartialEq<&str> for $owned {
            fn eq(&self, other: &&str) -> bool {
                &*self.0 == *other
            }
        }

        impl PartialEq<$id> for $owned {
            fn eq(&self, other: &$id) -> bool {
                &*self.0 == other.as_str()
            }
        }

        impl PartialEq<&$id> for $owned {
            fn eq(&self, other: &&$id) -> bool {
                &*self.0 == other.as_str()
            }
        }

        impl PartialEq<$owned> for $id {
            fn eq(&self, other: &$owned) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl PartialEq<$owned> for &$id {
            fn eq(&self, other: &$owned) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl serde::Serialize for $id {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl serde::Serialize for $owned {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $owned {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.try_into().map_err(serde::de::Error::custom)
            }
        }
    };
}
