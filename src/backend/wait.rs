use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::Backend;
use crate::csf_if::CsfInterface;
use crate::error::Result;

/// Future returned by [`Backend::dump_wait`].
///
/// Resolves once the outstanding request completed, with
/// [`Error::DumpNotReady`][crate::error::Error::DumpNotReady] if there was
/// none or it was abandoned by a disable, and with
/// [`Error::Unrecoverable`][crate::error::Error::Unrecoverable] if the backend
/// failed meanwhile.
pub struct DumpWait<'a, I: CsfInterface> {
    backend: &'a Backend<I>,
}

impl<'a, I: CsfInterface> DumpWait<'a, I> {
    pub(super) fn new(backend: &'a Backend<I>) -> Self {
        Self { backend }
    }
}

impl<I: CsfInterface> Future for DumpWait<'_, I> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let backend = self.backend;
        if let Poll::Ready(res) = backend.poll_dump() {
            return Poll::Ready(res);
        }
        // Register before checking again so a completion in between still wakes us.
        backend.waker().register(cx.waker());
        backend.poll_dump()
    }
}
