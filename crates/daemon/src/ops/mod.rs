pub mod convert;
pub mod copy;

pub use convert::ConvertOperationHandler;
pub use copy::CopyOperationHandler;
