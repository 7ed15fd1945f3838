use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::RemoteAddress;

/// Map keyed by remote address, stored as `"0x..."` hex strings on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressKeyMap<T>(pub HashMap<RemoteAddress, T>);

impl<T> Default for AddressKeyMap<T> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<T: Serialize> Serialize for AddressKeyMap<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(&format!("0x{:012x}", k.raw()), v)?;
        }
        map.end()
    }
}

impl<'de, T> Deserialize<'de> for AddressKeyMap<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AddressKeyMapVisitor<T>(std::marker::PhantomData<T>);

        impl<'de, T> Visitor<'de> for AddressKeyMapVisitor<T>
        where
            T: Deserialize<'de>,
        {
            type Value = AddressKeyMap<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a map with hexadecimal address keys and T values")
            }

            fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let mut values = HashMap::new();
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    let parsed_key = key
                        .parse::<RemoteAddress>()
                        .map_err(|_| de::Error::custom(format!("Invalid hex key: {}", key)))?;
                    values.insert(parsed_key, value);
                }
                Ok(AddressKeyMap(values))
            }
        }

        deserializer.deserialize_map(AddressKeyMapVisitor(std::marker::PhantomData))
    }
}
