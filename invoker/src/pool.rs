use parking_lot::Mutex;

use common::invocation::Invocation;

/// 可复用的调用上下文池
///
/// 归还时先 `reset`，取出的上下文与新建的完全相同
#[derive(Debug)]
pub struct InvocationPool {
    free: Mutex<Vec<Invocation>>,
    capacity: usize,
}

impl InvocationPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn get(&self) -> Invocation {
        self.free.lock().pop().unwrap_or_default()
    }

    pub fn put(&self, mut inv: Invocation) {
        inv.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(inv);
        }
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for InvocationPool {
    fn default() -> Self {
        Self::new(256)
    }
}
