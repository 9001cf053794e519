pub mod error;
pub mod types;
pub mod value;

pub use error::{
    BoxError, Details, ErrorCode, ErrorKind, ErrorReport, PersistError, Result, ValidationError,
};
pub use types::{FieldDef, FieldKind, FieldMap, FieldOptions};
pub use value::{Record, Value, parse_timestamp, timestamp_to_storage};
