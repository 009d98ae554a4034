mod array_value;
mod bytes_value;
mod map_value;
mod order;
pub mod server_timestamp;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use order::{compare_values, type_order, values_equal};
pub use value::{FirestoreValue, ValueKind};
