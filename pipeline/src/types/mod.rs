mod position;
mod record;
mod table;
mod value;

pub use position::*;
pub use record::*;
pub use table::*;
pub use value::*;
