use std::{
    cell::{Ref, RefCell, RefMut},
    cmp, fmt,
    rc::Rc,
};

/// The byte region shared with a `read` or `write` handler for one request.
///
/// For `write` it holds the incoming data, for `read` it is zero-filled with
/// the requested length and the handler fills it. The bridge keeps its own
/// clone and reads it back when the completion is called, so a handler must
/// not hold on to the buffer after completing.
#[derive(Clone)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .finish()
    }
}

impl SharedBuffer {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub(crate) fn from_vec(data: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(data)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the contents.
    ///
    /// # Panics
    /// Panics if the buffer is mutably borrowed at the same time.
    pub fn borrow(&self) -> Ref<'_, [u8]> {
        Ref::map(self.0.borrow(), Vec::as_slice)
    }

    /// Borrow the contents mutably. The length is fixed.
    ///
    /// # Panics
    /// Panics if the buffer is borrowed at the same time.
    pub fn borrow_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.0.borrow_mut(), Vec::as_mut_slice)
    }

    /// Copy `data` to the start of the buffer, returning the number of bytes
    /// that fit.
    pub fn fill(&self, data: &[u8]) -> usize {
        let mut buf = self.0.borrow_mut();
        let n = cmp::min(buf.len(), data.len());
        buf[..n].copy_from_slice(&data[..n]);
        n
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    /// Copy out at most `count` bytes from the start.
    pub(crate) fn prefix(&self, count: usize) -> Vec<u8> {
        let buf = self.0.borrow();
        buf[..cmp::min(count, buf.len())].to_vec()
    }
}
