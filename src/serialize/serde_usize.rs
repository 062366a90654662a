//! `#[serde(with = "serde_usize")]` for address-like fields, which serialize
//! as plain integers.

use std::marker::PhantomData;

use serde::{de::Visitor, Deserializer, Serializer};

use crate::units::Address;

pub trait AsUsize: Copy {
    fn as_usize(self) -> usize;
}

pub trait FromUsize: Copy {
    fn from_usize(value: usize) -> Self;
}

impl AsUsize for Address {
    fn as_usize(self) -> usize {
        self.addr()
    }
}

impl FromUsize for Address {
    /// The result has no provenance: it is only good for comparing and
    /// printing, never for dereferencing.
    fn from_usize(value: usize) -> Self {
        Address::new(std::ptr::null_mut::<u8>().wrapping_add(value))
    }
}

pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Copy + AsUsize,
{
    let value = (*value).as_usize();
    serializer.serialize_u64(value as u64)
}

pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromUsize,
{
    struct V<A>(PhantomData<A>);

    impl<'de, A> Visitor<'de> for V<A>
    where
        A: FromUsize,
    {
        type Value = A;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an address")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            usize::try_from(v)
                .map(A::from_usize)
                .map_err(|_| E::custom("address does not fit in a usize"))
        }
    }

    deserializer.deserialize_u64(V::<T>(PhantomData))
}
