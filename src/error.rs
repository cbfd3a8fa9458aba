use core::fmt;

/// Why an allocator operation could not complete.
///
/// `E` is the error type of the [`AddressSpace`](../allocators/trait.AddressSpace.html)
/// provider in use. Whatever the variant, the directory is left exactly as it
/// was before the failing call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AllocError<E> {
    /// The provider could not extend the arena or map a region.
    Exhausted(E),
    /// The provider failed to release a mapped region. The block is still
    /// registered and still owned by the caller.
    Unmap(E),
    /// The pointer was not handed out by this allocator, or was already merged
    /// into a neighbouring block.
    InvalidPointer,
    /// The requested size does not fit in a `usize` once the header is added.
    Overflow,
}

impl<E: fmt::Debug> fmt::Display for AllocError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Exhausted(err) => write!(f, "address space exhausted: {:?}", err),
            AllocError::Unmap(err) => write!(f, "could not unmap region: {:?}", err),
            AllocError::InvalidPointer => write!(f, "pointer was not allocated here"),
            AllocError::Overflow => write!(f, "requested size overflows"),
        }
    }
}
