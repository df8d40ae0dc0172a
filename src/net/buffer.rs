use std::sync::{Mutex, PoisonError};

/// The source (for writes) or destination (for reads) of a channel operation.
///
/// A channel asks for the buffer when the socket is ready, hands it back with
/// [BufferSupplier::retain] whenever an operation has to be resumed later and
/// calls [BufferSupplier::release] exactly once, when the operation it was
/// passed to reaches a terminal state for whatever reason.
///
/// For reads the length of the buffer is the most that will be read. For
/// writes the buffer holds the bytes still to be sent; a partially written
/// buffer is retained with the sent prefix removed.
pub trait BufferSupplier: Send + 'static {
    fn get_buffer(&mut self) -> Vec<u8>;
    fn retain(&mut self, buf: Vec<u8>);
    fn release(&mut self);
}

/// A plain vector is its own supplier.
impl BufferSupplier for Vec<u8> {
    fn get_buffer(&mut self) -> Vec<u8> {
        std::mem::take(self)
    }

    fn retain(&mut self, buf: Vec<u8>) {
        *self = buf;
    }

    fn release(&mut self) {}
}

/// A supplier on loan to an outstanding request.
///
/// Once released, the supplier is dropped and any buffer handed back
/// afterwards is discarded.
pub(crate) struct Lease {
    supplier: Mutex<Option<Box<dyn BufferSupplier>>>,
}

impl Lease {
    pub fn new(supplier: impl BufferSupplier) -> Self {
        Self {
            supplier: Mutex::new(Some(Box::new(supplier))),
        }
    }

    /// `None` once the lease has been released.
    pub fn checkout(&self) -> Option<Vec<u8>> {
        self.lock().as_mut().map(|s| s.get_buffer())
    }

    pub fn checkin(&self, buf: Vec<u8>) {
        if let Some(s) = self.lock().as_mut() {
            s.retain(buf);
        }
    }

    /// Release the supplier. Only the first call has any effect.
    pub fn release(&self) {
        let supplier = self.lock().take();

        if let Some(mut s) = supplier {
            s.release();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Box<dyn BufferSupplier>>> {
        self.supplier.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{BufferSupplier, Lease};

    /// A supplier that counts how often it is released.
    struct Counting {
        buf: Vec<u8>,
        released: Arc<AtomicUsize>,
    }

    impl Counting {
        fn new(buf: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
            let released = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    buf,
                    released: released.clone(),
                },
                released,
            )
        }
    }

    impl BufferSupplier for Counting {
        fn get_buffer(&mut self) -> Vec<u8> {
            std::mem::take(&mut self.buf)
        }

        fn retain(&mut self, buf: Vec<u8>) {
            self.buf = buf;
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_happens_once() {
        let (supplier, released) = Counting::new(vec![1, 2, 3]);
        let lease = Lease::new(supplier);

        let buf = lease.checkout().unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
        lease.checkin(buf[1..].to_vec());
        assert_eq!(lease.checkout().unwrap(), vec![2, 3]);

        lease.release();
        lease.release();

        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(lease.checkout().is_none());
    }

    #[test]
    fn checkin_after_release_is_dropped() {
        let (supplier, released) = Counting::new(vec![0; 8]);
        let lease = Lease::new(supplier);

        let buf = lease.checkout().unwrap();
        lease.release();
        lease.checkin(buf);

        assert!(lease.checkout().is_none());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
