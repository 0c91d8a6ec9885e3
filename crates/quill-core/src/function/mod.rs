mod traits;

pub use traits::{
    BackoffStrategy, ConcurrencyConfig, FunctionInfo, QuillFunction, RetryConfig,
};
