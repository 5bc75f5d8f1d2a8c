pub mod binding;
pub mod builder;
pub mod runtime;
pub mod traits;
