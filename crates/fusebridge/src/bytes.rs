//! Scatter-gather byte sequences used to assemble reply messages.

use either::Either;
use std::{ffi::OsStr, os::unix::prelude::*};
use zerocopy::{Immutable, IntoBytes};

/// A reply payload made of one or more byte chunks.
///
/// The kernel requires the header and the whole payload of a reply to arrive
/// in a single `write(2)`, so a payload is described as a list of chunks that
/// the transport hands to `writev(2)` at once instead of being copied into a
/// contiguous buffer first.
pub trait Bytes {
    /// Return the total amount of bytes contained in this data.
    fn size(&self) -> usize;

    /// Return the number of non-empty chunks.
    fn count(&self) -> usize;

    /// Put every non-empty chunk into `dst`, in order.
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>);
}

/// The container of scattered bytes.
pub trait FillBytes<'a> {
    /// Put a chunk of bytes into this container.
    fn put(&mut self, chunk: &'a [u8]);
}

#[cfg(test)]
impl FillBytes<'_> for Vec<u8> {
    fn put(&mut self, chunk: &'_ [u8]) {
        self.extend_from_slice(chunk);
    }
}

/// Concatenate all chunks of `bytes` into a single vector.
#[cfg(test)]
pub(crate) fn to_vec(bytes: &dyn Bytes) -> Vec<u8> {
    let mut buf = Vec::with_capacity(bytes.size());
    bytes.fill_bytes(&mut buf);
    buf
}

impl<R: ?Sized> Bytes for &R
where
    R: Bytes,
{
    #[inline]
    fn size(&self) -> usize {
        (**self).size()
    }

    #[inline]
    fn count(&self) -> usize {
        (**self).count()
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        (**self).fill_bytes(dst)
    }
}

// ==== empty bytes ====

impl Bytes for () {
    #[inline]
    fn size(&self) -> usize {
        0
    }

    #[inline]
    fn count(&self) -> usize {
        0
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, _: &mut dyn FillBytes<'a>) {}
}

// ==== compound types ====

macro_rules! impl_bytes_for_tuple {
    ($($T:ident),+ $(,)?) => {
        #[allow(nonstandard_style)]
        impl<$($T),+> Bytes for ($($T,)+)
        where
            $( $T: Bytes, )+
        {
            #[inline]
            fn size(&self) -> usize {
                let ($($T,)+) = self;
                0 $( + $T.size() )+
            }

            #[inline]
            fn count(&self) -> usize {
                let ($($T,)+) = self;
                0 $( + $T.count() )+
            }

            #[inline]
            fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
                let ($($T,)+) = self;
                $(
                    Bytes::fill_bytes($T, dst);
                )+
            }
        }
    }
}

impl_bytes_for_tuple!(T1);
impl_bytes_for_tuple!(T1, T2);
impl_bytes_for_tuple!(T1, T2, T3);
impl_bytes_for_tuple!(T1, T2, T3, T4);

impl<R> Bytes for [R]
where
    R: Bytes,
{
    #[inline]
    fn size(&self) -> usize {
        self.iter().map(|chunk| chunk.size()).sum()
    }

    #[inline]
    fn count(&self) -> usize {
        self.iter().map(|chunk| chunk.count()).sum()
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        for t in self {
            Bytes::fill_bytes(t, dst);
        }
    }
}

impl<L, R> Bytes for Either<L, R>
where
    L: Bytes,
    R: Bytes,
{
    #[inline]
    fn size(&self) -> usize {
        either::for_both!(self, b => b.size())
    }

    #[inline]
    fn count(&self) -> usize {
        either::for_both!(self, b => b.count())
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        either::for_both!(self, b => Bytes::fill_bytes(b, dst))
    }
}

// ==== continuous bytes ====

impl Bytes for [u8] {
    #[inline]
    fn size(&self) -> usize {
        self.len()
    }

    #[inline]
    fn count(&self) -> usize {
        usize::from(!self.is_empty())
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        if !self.is_empty() {
            dst.put(self);
        }
    }
}

macro_rules! impl_bytes_for_cont {
    ($($t:ty),*$(,)?) => {$(
        impl Bytes for $t {
            #[inline]
            fn size(&self) -> usize {
                Bytes::size(AsRef::<[u8]>::as_ref(self))
            }

            #[inline]
            fn count(&self) -> usize {
                Bytes::count(AsRef::<[u8]>::as_ref(self))
            }

            #[inline]
            fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
                Bytes::fill_bytes(AsRef::<[u8]>::as_ref(self), dst)
            }
        }
    )*};
}

impl_bytes_for_cont! {
    str,
    String,
    Vec<u8>,
}

impl Bytes for OsStr {
    #[inline]
    fn size(&self) -> usize {
        Bytes::size(self.as_bytes())
    }

    #[inline]
    fn count(&self) -> usize {
        Bytes::count(self.as_bytes())
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        Bytes::fill_bytes(self.as_bytes(), dst)
    }
}

/// A plain-old-data value sent as its in-memory representation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct POD<T>(pub T);

impl<T> Bytes for POD<T>
where
    T: IntoBytes + Immutable,
{
    #[inline]
    fn count(&self) -> usize {
        1
    }

    #[inline]
    fn size(&self) -> usize {
        self.0.as_bytes().len()
    }

    #[inline]
    fn fill_bytes<'a>(&'a self, dst: &mut dyn FillBytes<'a>) {
        dst.put(self.0.as_bytes());
    }
}
