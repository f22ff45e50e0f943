mod json;
pub use json::*;
mod properties;
pub use properties::*;
mod rows;
pub use rows::*;
