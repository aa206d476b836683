// Finalizer invocation
//
// A finalizer is the `__gc` field of an object's behavior record, looked up
// when it is about to run. It is called as a protected call on the running
// thread, with the function and the object pushed on that thread's stack
// so both stay reachable while it runs.

use crate::GcId;
use crate::gc::GcObjectData;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaHeap, LuaResult};

impl LuaHeap {
    /// Callable `__gc` of the object's behavior record
    pub(crate) fn gc_metamethod(&self, id: GcId) -> Option<LuaValue> {
        let mt = self.alloc.get(id)?.metatable()?;
        let key = self.alloc.value_of(self.alloc.consts.tm_gc()?)?;
        let func = self.alloc.get(mt)?.as_table()?.raw_get(&key)?;
        func.is_function().then_some(func)
    }

    /// Call a native function or native closure. Bound values of a closure
    /// follow the arguments.
    pub(crate) fn call_value(&mut self, func: LuaValue, args: &[LuaValue]) -> LuaResult<()> {
        if let Some(f) = func.as_cfunction() {
            return f(self, args);
        }
        let closure = func
            .gc_id()
            .and_then(|id| self.alloc.get(id))
            .and_then(|obj| match &obj.data {
                GcObjectData::CClosure(c) => Some((c.func, c.upvalues.clone())),
                _ => None,
            });
        match closure {
            Some((f, bound)) => {
                let mut full = Vec::with_capacity(args.len() + bound.len());
                full.extend_from_slice(args);
                full.extend(bound);
                f(self, &full)
            }
            None => Err(LuaError::RuntimeError(format!(
                "attempt to call a {} value",
                func.type_name()
            ))),
        }
    }

    /// Run the finalizer of `id` if it still has one. Errors come back
    /// reclassified as finalizer errors.
    pub(crate) fn call_finalizer(&mut self, id: GcId) -> LuaResult<()> {
        let Some(object) = self.alloc.value_of(id) else {
            return Ok(());
        };
        let Some(func) = self.gc_metamethod(id) else {
            return Ok(());
        };
        // after shutdown has dropped the threads the call runs bare
        let thread = self.running_thread().gc_id();
        let base = match thread {
            Some(thread) => Some(self.thread_top(thread)?),
            None => None,
        };
        if let Some(thread) = thread {
            for v in [func, object] {
                self.alloc.inc_ref(v);
                if let Some(th) = self.alloc.get_mut(thread).and_then(|o| o.as_thread_mut()) {
                    th.stack.push(v);
                }
            }
        }

        let saved = self.gc.gc_stopem;
        self.gc.gc_stopem = true;
        let result = self.call_value(func, &[object]);
        self.gc.gc_stopem = saved;
        self.alloc.stats.finalizers_called += 1;

        if let (Some(thread), Some(base)) = (thread, base) {
            if self.set_top(thread, base).is_err() {
                log::debug!("thread {thread} died while running a finalizer");
            }
        }
        result.map_err(|err| match err {
            LuaError::GcMetamethod(_) => err,
            other => LuaError::GcMetamethod(other.to_string()),
        })
    }

    fn thread_top(&self, thread: GcId) -> LuaResult<usize> {
        self.alloc
            .get(thread)
            .and_then(|o| o.as_thread())
            .map(|th| th.top())
            .ok_or(LuaError::InvalidHandle)
    }

    /// Keep the first error for an explicit request that propagates them,
    /// log the rest
    pub(crate) fn note_finalizer_result(&mut self, result: LuaResult<()>) {
        let Err(err) = result else {
            return;
        };
        self.alloc.stats.finalizer_errors += 1;
        if self.collect_errors && self.finalizer_error.is_none() {
            self.finalizer_error = Some(err);
        } else {
            log::warn!("{err}");
        }
    }

    /// Finalize the next queued object and drop the queue's reference.
    /// Returns false when the queue is empty.
    pub(crate) fn run_one_finalizer(&mut self) -> bool {
        let Some(id) = self.alloc.tobefnz.pop_front() else {
            return false;
        };
        let result = self.call_finalizer(id);
        self.note_finalizer_result(result);
        if self.alloc.get(id).is_some() {
            self.alloc.dec_ref_id(id);
        }
        true
    }

    pub(crate) fn run_pending_finalizers(&mut self) -> usize {
        let mut count = 0;
        while self.run_one_finalizer() {
            count += 1;
        }
        count
    }

    /// Run every queued finalizer now. Returns how many ran.
    pub fn call_pending_finalizers(&mut self) -> LuaResult<usize> {
        self.explicit(|heap| {
            if heap.gc.gc_stopem {
                return 0;
            }
            heap.run_pending_finalizers()
        })
    }

    /// Number of objects waiting for their finalizer
    pub fn pending_finalizers(&self) -> usize {
        self.alloc.tobefnz.len()
    }
}
