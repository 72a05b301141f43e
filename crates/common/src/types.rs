use serde::{Deserialize, Serialize};

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database identifier.
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw identifier.
            pub const fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

record_id!(
    /// Identifier of an order. Orders are created before any reservation is made.
    OrderId
);

record_id!(
    /// Identifier of the user owning an order.
    UserId
);

record_id!(
    /// Identifier of a catalog product.
    ProductId
);

record_id!(
    /// Identifier of a warehouse.
    ///
    /// Ordering is significant: first-fit selection and lock acquisition both
    /// walk warehouses in ascending id order.
    WarehouseId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warehouse_ids_order_ascending() {
        let mut ids = vec![WarehouseId::new(3), WarehouseId::new(1), WarehouseId::new(2)];
        ids.sort();
        assert_eq!(
            ids,
            vec![WarehouseId::new(1), WarehouseId::new(2), WarehouseId::new(3)]
        );
    }

    #[test]
    fn order_id_parses_from_trimmed_string() {
        let id: OrderId = " 42 ".parse().unwrap();
        assert_eq!(id, OrderId::new(42));
        assert!("forty-two".parse::<OrderId>().is_err());
    }

    #[test]
    fn ids_serialize_as_bare_integers() {
        let json = serde_json::to_string(&ProductId::new(7)).unwrap();
        assert_eq!(json, "7");
        let back: ProductId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProductId::new(7));
    }
}
