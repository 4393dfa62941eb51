// SN 关联注册表
// MANSCDP 报文的 24 位序列号分配与响应回调

use crate::xml::Manscdp;
use std::collections::HashMap;
use std::sync::Mutex;

/// 响应到达时消费的一次性回调
pub type SnCallback = Box<dyn FnOnce(&Manscdp) + Send>;

const SN_MODULUS: u32 = 0x100_0000;

/// 24 位 SN 分配器。单调递增取模，跳过仍有未决回调的值。
/// 回调不由注册表超时投递：调用方超时后自行 `cancel`。
pub struct SnRegistry {
    inner: Mutex<SnInner>,
}

struct SnInner {
    next: u32,
    callbacks: HashMap<u32, SnCallback>,
}

impl SnRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SnInner {
                next: 1,
                callbacks: HashMap::new(),
            }),
        }
    }

    /// 分配下一个 SN
    pub fn next_sn(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let sn = inner.next;
            inner.next = (inner.next + 1) % SN_MODULUS;
            if inner.next == 0 {
                inner.next = 1;
            }
            if !inner.callbacks.contains_key(&sn) {
                return sn;
            }
        }
    }

    /// 分配 SN 并挂接响应回调
    pub fn next_sn_with_callback(&self, cb: SnCallback) -> u32 {
        let sn = self.next_sn();
        self.inner.lock().unwrap().callbacks.insert(sn, cb);
        sn
    }

    /// 响应到达：取出并消费回调。返回是否命中。
    pub fn dispatch(&self, sn: u32, body: &Manscdp) -> bool {
        let cb = self.inner.lock().unwrap().callbacks.remove(&sn);
        match cb {
            Some(cb) => {
                cb(body);
                true
            }
            None => false,
        }
    }

    /// 调用方超时后清理回调
    pub fn cancel(&self, sn: u32) {
        self.inner.lock().unwrap().callbacks.remove(&sn);
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().callbacks.len()
    }
}

impl Default for SnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_monotonic_allocation() {
        let reg = SnRegistry::new();
        let a = reg.next_sn();
        let b = reg.next_sn();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_skip_outstanding() {
        let reg = SnRegistry::new();
        let taken = reg.next_sn_with_callback(Box::new(|_| {}));

        // 绕一整圈后也不会复用未决的 SN
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.next = taken;
        }
        let next = reg.next_sn();
        assert_ne!(next, taken);
    }

    #[test]
    fn test_dispatch_consumes_callback() {
        let reg = SnRegistry::new();
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let sn = reg.next_sn_with_callback(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        let body = Manscdp::default();
        assert!(reg.dispatch(sn, &body));
        assert!(!reg.dispatch(sn, &body));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reg.outstanding(), 0);
    }

    #[test]
    fn test_cancel() {
        let reg = SnRegistry::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let sn = reg.next_sn_with_callback(Box::new(move |_| {
            fired2.store(true, Ordering::SeqCst);
        }));
        reg.cancel(sn);
        assert!(!reg.dispatch(sn, &Manscdp::default()));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_wraparound() {
        let reg = SnRegistry::new();
        {
            let mut inner = reg.inner.lock().unwrap();
            inner.next = SN_MODULUS - 1;
        }
        let a = reg.next_sn();
        assert_eq!(a, SN_MODULUS - 1);
        // 0 被跳过
        let b = reg.next_sn();
        assert_eq!(b, 1);
    }
}
