use std::any::Any;

/// Bounds for the errors that may escape the operator's top level. Most of the crate works with
/// concrete error enums, but startup and shutdown only expose this opaque boxed type, which has
/// to be sendable between threads.
pub trait OperatorError: std::error::Error + Send + 'static + Any {
    fn as_any(&self) -> &dyn Any;
}
impl<T> OperatorError for T
where
    T: std::error::Error + Send + 'static + Any,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub type Error = Box<dyn OperatorError>;

impl dyn OperatorError {
    /// convenience function for downcasting the error to a concrete type
    pub fn as_type<T: OperatorError>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// returns true if `as_type::<T>()` would return `Some`
    pub fn is_type<T: OperatorError>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

impl<T> From<T> for Error
where
    T: OperatorError,
{
    fn from(e: T) -> Error {
        Box::new(e)
    }
}
