/// Anything that can be initialized with a `const` value, so that it can
/// live in a `static`.
pub trait ConstInit {
    /// The `const` default initializer value for `Self`.
    const INIT: Self;
}

impl<T> ConstInit for Option<T> {
    const INIT: Self = None;
}
