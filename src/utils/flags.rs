//! Plain bitset newtypes for wire flags and policy masks.

/// Declares a `Copy` newtype over an unsigned integer with named flag constants.
///
/// The generated type supports `|`, `&`, `contains`, `intersects`, `bits` and
/// `from_bits` (rejects unknown bits).
#[macro_export]
macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $( $(#[$fmeta:meta])* const $flag:ident = $value:expr; )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: $name = $name($value); )+

            pub const NONE: $name = $name(0);

            const ALL_BITS: $repr = 0 $( | $value )+;

            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Returns `None` when `bits` carries a flag this type does not define.
            pub const fn from_bits(bits: $repr) -> Option<Self> {
                if bits & !Self::ALL_BITS == 0 {
                    Some($name(bits))
                } else {
                    None
                }
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut names = Vec::new();
                $(
                    if $value != 0 && self.0 & $value == $value {
                        names.push(stringify!($flag));
                    }
                )+
                if names.is_empty() {
                    write!(f, "{}(NONE)", stringify!($name))
                } else {
                    write!(f, "{}({})", stringify!($name), names.join(" | "))
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    crate::flag_set! {
        pub struct TestFlags: u8 {
            const A = 1;
            const B = 2;
        }
    }

    #[test]
    fn from_bits_rejects_unknown_flags() {
        assert_eq!(TestFlags::from_bits(3), Some(TestFlags::A | TestFlags::B));
        assert_eq!(TestFlags::from_bits(4), None);
    }

    #[test]
    fn contains_and_debug() {
        let flags = TestFlags::A | TestFlags::B;
        assert!(flags.contains(TestFlags::A));
        assert!(!TestFlags::A.contains(flags));
        assert_eq!(format!("{:?}", flags), "TestFlags(A | B)");
        assert_eq!(format!("{:?}", TestFlags::NONE), "TestFlags(NONE)");
    }
}
