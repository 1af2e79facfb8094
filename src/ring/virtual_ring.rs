use std::sync::{Condvar, Mutex};

use super::RingBuffer;

struct State {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    len: usize,
    thres_write: usize,
    thres_read: usize,
}

impl State {
    fn free_space(&self) -> usize {
        self.buf.len() - self.len
    }
}

/// A ring buffer backed by one contiguous heap allocation.
///
/// This is the default backing: simple head/tail arithmetic over a
/// `Vec<u8>`, a single mutex guarding both cursors, and two condvars
/// standing in for the level-triggered readable/writable signals.
pub struct VirtualRing {
    state: Mutex<State>,
    writable: Condvar,
    readable: Condvar,
}

impl VirtualRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                buf: vec![0u8; capacity],
                head: 0,
                tail: 0,
                len: 0,
                thres_write: 0,
                thres_read: 0,
            }),
            writable: Condvar::new(),
            readable: Condvar::new(),
        }
    }
}

impl RingBuffer for VirtualRing {
    fn capacity(&self) -> usize {
        self.state.lock().unwrap().buf.len()
    }

    fn data_avail(&self) -> usize {
        self.state.lock().unwrap().len
    }

    fn free_space(&self) -> usize {
        self.state.lock().unwrap().free_space()
    }

    fn set_thres_write(&self, thres: usize) {
        let mut st = self.state.lock().unwrap();
        st.thres_write = thres;
        if st.free_space() >= thres {
            self.writable.notify_all();
        }
    }

    fn set_thres_read(&self, thres: usize) {
        let mut st = self.state.lock().unwrap();
        st.thres_read = thres;
        if st.len >= thres {
            self.readable.notify_all();
        }
    }

    fn write(&self, buf: &[u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        let n = buf.len().min(st.free_space());
        let cap = st.buf.len();
        for (i, &b) in buf[..n].iter().enumerate() {
            let pos = (st.tail + i) % cap;
            st.buf[pos] = b;
        }
        st.tail = (st.tail + n) % cap;
        st.len += n;
        if st.len >= st.thres_read {
            self.readable.notify_all();
        }
        n
    }

    fn read(&self, buf: &mut [u8]) -> usize {
        let mut st = self.state.lock().unwrap();
        let n = buf.len().min(st.len);
        let cap = st.buf.len();
        for i in 0..n {
            let pos = (st.head + i) % cap;
            buf[i] = st.buf[pos];
        }
        st.head = (st.head + n) % cap;
        st.len -= n;
        if st.free_space() >= st.thres_write {
            self.writable.notify_all();
        }
        n
    }

    fn wait_writable(&self) {
        let mut st = self.state.lock().unwrap();
        while st.free_space() < st.thres_write {
            st = self.writable.wait(st).unwrap();
        }
    }

    fn wait_readable(&self) {
        let mut st = self.state.lock().unwrap();
        while st.len < st.thres_read {
            st = self.readable.wait(st).unwrap();
        }
    }

    fn reset(&self) {
        let mut st = self.state.lock().unwrap();
        st.head = 0;
        st.tail = 0;
        st.len = 0;
        st.thres_write = 0;
        st.thres_read = 0;
        self.writable.notify_all();
        self.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_bytes() {
        let ring = VirtualRing::new(16);
        let data = b"hello world";
        assert_eq!(ring.write(data), data.len());
        let mut out = [0u8; 11];
        assert_eq!(ring.read(&mut out), 11);
        assert_eq!(&out, data);
    }

    #[test]
    fn write_is_capped_by_free_space() {
        let ring = VirtualRing::new(4);
        assert_eq!(ring.write(b"abcdef"), 4);
        assert_eq!(ring.free_space(), 0);
    }

    #[test]
    fn threshold_signals_are_level_triggered() {
        let ring = VirtualRing::new(8);
        ring.set_thres_read(4);
        ring.write(b"abc");
        assert!(ring.data_avail() < 4);
        ring.write(b"d");
        assert_eq!(ring.data_avail(), 4);
        ring.wait_readable();
    }

    #[test]
    fn wraps_around_the_backing_buffer() {
        let ring = VirtualRing::new(4);
        let mut out = [0u8; 2];
        ring.write(b"ab");
        ring.read(&mut out);
        ring.write(b"cdef");
        let mut all = [0u8; 4];
        ring.read(&mut all);
        assert_eq!(&all, b"cdef");
    }

    #[test]
    fn reset_clears_queued_data_and_thresholds() {
        let ring = VirtualRing::new(8);
        ring.write(b"abcd");
        ring.reset();
        assert_eq!(ring.data_avail(), 0);
        assert_eq!(ring.free_space(), 8);
    }
}
