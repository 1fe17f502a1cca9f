use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};

use super::buffer_pool::BufferPool;

/// Response body that copies data through a pooled buffer, coalescing frames
/// that are ready at the same time. Nothing is held back once the inner body
/// would block.
pub struct PooledBody<B> {
    inner: B,
    pool: BufferPool,
    buf: Option<Vec<u8>>,
    pending: Option<Frame<Bytes>>,
    done: bool,
}

impl<B> PooledBody<B> {
    pub fn new(inner: B, pool: BufferPool) -> Self {
        Self {
            inner,
            pool,
            buf: None,
            pending: None,
            done: false,
        }
    }

    fn buffered(&self) -> usize {
        self.buf.as_ref().map_or(0, Vec::len)
    }

    fn flush(&mut self) -> Option<Frame<Bytes>> {
        let buf = self.buf.as_mut().filter(|b| !b.is_empty())?;
        let data = Bytes::copy_from_slice(buf);
        buf.clear();
        Some(Frame::data(data))
    }

    fn release(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

impl<B> Body for PooledBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(frame) = this.pending.take() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if this.done {
            return Poll::Ready(this.flush().map(Ok));
        }

        loop {
            let frame = match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Pending => {
                    return match this.flush() {
                        Some(frame) => Poll::Ready(Some(Ok(frame))),
                        None => Poll::Pending,
                    };
                }
                Poll::Ready(None) => {
                    this.done = true;
                    let out = this.flush();
                    this.release();
                    return Poll::Ready(out.map(Ok));
                }
                Poll::Ready(Some(Err(err))) => {
                    this.done = true;
                    this.release();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Some(Ok(frame))) => frame,
            };

            let data = match frame.into_data() {
                Ok(data) => data,
                Err(trailers) => {
                    return match this.flush() {
                        Some(out) => {
                            this.pending = Some(trailers);
                            Poll::Ready(Some(Ok(out)))
                        }
                        None => Poll::Ready(Some(Ok(trailers))),
                    };
                }
            };

            let pool = &this.pool;
            let capacity = this.buf.get_or_insert_with(|| pool.get()).capacity();

            if this.buffered() == 0 && data.len() >= capacity {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }

            if this.buffered() + data.len() > capacity {
                let out = this.flush();
                if data.len() >= capacity {
                    this.pending = Some(Frame::data(data));
                } else if let Some(buf) = this.buf.as_mut() {
                    buf.extend_from_slice(&data);
                }
                if let Some(out) = out {
                    return Poll::Ready(Some(Ok(out)));
                }
                continue;
            }

            if let Some(buf) = this.buf.as_mut() {
                buf.extend_from_slice(&data);
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_none() && self.buffered() == 0 && (self.done || self.inner.is_end_stream())
    }

    fn size_hint(&self) -> SizeHint {
        let held = self.buffered() as u64
            + self
                .pending
                .as_ref()
                .and_then(Frame::data_ref)
                .map_or(0, |d| d.len() as u64);
        let inner = self.inner.size_hint();
        let mut hint = SizeHint::new();
        hint.set_lower(inner.lower() + held);
        if let Some(upper) = inner.upper() {
            hint.set_upper(upper + held);
        }
        hint
    }
}

impl<B> Drop for PooledBody<B> {
    fn drop(&mut self) {
        self.release();
    }
}
