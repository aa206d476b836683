// Collector driver
//
// Step points, the tracing state machine (singlestep / incstep / fullinc of
// the reference runtime), generational scans and the explicit collection
// requests. Lives on LuaHeap because finalizers need the whole heap.

use crate::gc::{GcKind, GcState, STEPMUL, STEPSIZE};
use crate::lua_value::{LUA_VTABLE, LuaValue};
use crate::lua_vm::lua_limits::{GCFINALIZECOST, GCSWEEPMAX, NUM_GENERATIONS};
use crate::lua_vm::{FinalizerErrors, LuaHeap, LuaResult};

/// Result of a single GC step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepResult {
    /// Work units done
    Work(isize),
    /// Atomic step completed
    Atomic,
    /// End of cycle
    Pause,
}

impl LuaHeap {
    /// Registry, threads and type behavior records; the collector adds
    /// anchors and the finalizer queue itself
    pub(crate) fn gc_roots(&self) -> Vec<LuaValue> {
        let mut roots = vec![self.registry(), self.main_thread(), self.running_thread()];
        for mt in self.type_metatables_ids() {
            roots.push(LuaValue::from_gc(LUA_VTABLE, mt));
        }
        roots
    }

    /// Allocation step point
    pub(crate) fn check_gc(&mut self) {
        if self.gc.gc_stopem || self.gc.gc_stopped || self.alloc.gens.collecting {
            return;
        }
        match self.gc.gc_kind {
            GcKind::Generational => {
                if let Some(generation) = self.alloc.gens.due() {
                    self.generation_scan(generation);
                }
            }
            GcKind::Incremental => {
                if self.gc.should_collect() {
                    self.inc_step();
                }
            }
        }
        if !self.alloc.tobefnz.is_empty() && !self.gc.gc_stopem {
            self.run_pending_finalizers();
        }
    }

    // ==================== Tracing state machine ====================

    pub(crate) fn single_step(&mut self, fast: bool) -> StepResult {
        if self.gc.gc_stopem {
            return StepResult::Work(0);
        }
        self.gc.gc_stopem = true;

        let result = match self.gc.gc_state {
            GcState::Pause => {
                let roots = self.gc_roots();
                self.gc.restart_collection(&mut self.alloc, &roots);
                self.gc.gc_state = GcState::Propagate;
                log::trace!("gc cycle started");
                StepResult::Work(1)
            }
            GcState::Propagate => {
                if fast || self.gc.gray.is_empty() {
                    self.gc.gc_state = GcState::EnterAtomic;
                    StepResult::Work(1)
                } else {
                    StepResult::Work(self.gc.propagate_mark(&mut self.alloc))
                }
            }
            GcState::EnterAtomic => {
                let roots = self.gc_roots();
                self.gc.atomic(&mut self.alloc, &roots);
                self.gc.enter_sweep();
                StepResult::Atomic
            }
            GcState::SwpAllGc => {
                if self.gc.sweep_step(&mut self.alloc, fast) {
                    self.gc.gc_state = GcState::SwpFinObj;
                }
                StepResult::Work(GCSWEEPMAX as isize)
            }
            GcState::SwpFinObj => {
                self.gc.sweep_finobj(&mut self.alloc);
                self.gc.gc_state = GcState::SwpToBeFnz;
                StepResult::Work(1)
            }
            GcState::SwpToBeFnz => {
                self.gc.sweep_tobefnz(&mut self.alloc);
                self.gc.gc_state = GcState::SwpEnd;
                StepResult::Work(1)
            }
            GcState::SwpEnd => {
                self.gc.sweep_end(&mut self.alloc);
                self.gc.gc_state = GcState::CallFin;
                log::trace!("gc sweep finished, {} bytes in use", self.alloc.total_bytes);
                StepResult::Work(1)
            }
            GcState::CallFin => {
                if !self.alloc.tobefnz.is_empty() && !self.gc.gc_emergency {
                    // finalizers may allocate; each call blocks steps itself
                    self.gc.gc_stopem = false;
                    let batch = if fast { usize::MAX } else { self.gc.gcfinnum };
                    let mut done = 0;
                    while done < batch && self.run_one_finalizer() {
                        done += 1;
                    }
                    self.gc.gcfinnum = self.gc.gcfinnum.saturating_mul(2);
                    StepResult::Work(done as isize * GCFINALIZECOST)
                } else {
                    self.gc.gc_state = GcState::Pause;
                    StepResult::Pause
                }
            }
            GcState::Atomic => StepResult::Work(0),
        };

        self.gc.gc_stopem = false;
        result
    }

    /// Bounded amount of tracing work, paid for by allocation debt
    pub(crate) fn inc_step(&mut self) {
        let stepsize = self.gc.apply_param(STEPSIZE, 100);
        let ptr_size = std::mem::size_of::<*const ()>() as isize;
        let mut work2do = self.gc.apply_param(STEPMUL, stepsize / ptr_size);
        let fast = work2do == 0;

        loop {
            match self.single_step(fast) {
                StepResult::Pause => break,
                StepResult::Atomic => {
                    if !fast {
                        break;
                    }
                }
                StepResult::Work(0) if self.gc.gc_stopem => break,
                StepResult::Work(w) => work2do -= w,
            }
            if !fast && work2do <= 0 {
                break;
            }
        }

        if self.gc.gc_state == GcState::Pause {
            self.gc.set_pause(&mut self.alloc);
        } else {
            self.gc.set_debt(stepsize, self.alloc.total_bytes);
        }
    }

    fn run_until_state(&mut self, target: GcState) {
        while self.gc.gc_state != target {
            if self.gc.gc_stopem {
                return;
            }
            self.single_step(true);
        }
    }

    /// Complete collection: a scan of every generation, then a whole
    /// tracing cycle. Emergency mode runs no finalizers and shrinks nothing.
    pub(crate) fn full_gc(&mut self, emergency: bool) {
        if self.gc.gc_stopem || self.alloc.gens.collecting {
            return;
        }
        let before = self.alloc.total_bytes;
        self.gc.gc_emergency = emergency;

        let oldest = NUM_GENERATIONS - 1;
        if emergency {
            self.alloc.scan_queueing_finalizers(oldest);
        } else {
            self.generation_scan(oldest);
        }

        // a cycle in its mark phase is abandoned: sweeping now only whitens
        if self.gc.keep_invariant() {
            self.gc.enter_sweep();
        }
        self.run_until_state(GcState::Pause);
        self.run_until_state(GcState::CallFin);
        self.run_until_state(GcState::Pause);
        self.gc.set_pause(&mut self.alloc);
        self.gc.gc_emergency = false;

        self.alloc.stats.collection_count += 1;
        if emergency {
            self.alloc.stats.emergency_collections += 1;
        }
        log::debug!(
            "{} collection: {} -> {} bytes",
            if emergency { "emergency" } else { "full" },
            before,
            self.alloc.total_bytes
        );
    }

    // ==================== Generational scans ====================

    /// Scan `generation` (and everything younger), running the finalizers
    /// of unreachable objects before deciding what to destroy
    pub(crate) fn generation_scan(&mut self, generation: usize) -> usize {
        let Some(scan) = self.alloc.begin_scan(generation) else {
            return 0;
        };
        if !scan.finalizers.is_empty() {
            self.alloc.release_finalizer_marks(&scan);
            for &id in &scan.finalizers {
                let result = self.call_finalizer(id);
                self.note_finalizer_result(result);
            }
        }
        let generation = scan.generation;
        let unreachable = scan.unreachable;
        let freed = self.alloc.finish_scan(scan);
        log::debug!("gen{generation} scan: {unreachable} unreachable, {freed} freed");
        freed
    }

    /// Scan everything, queueing finalizers instead of calling them
    pub(crate) fn generation_scan_queueing(&mut self) -> usize {
        self.alloc.scan_queueing_finalizers(NUM_GENERATIONS - 1)
    }

    // ==================== Explicit requests ====================

    /// Run a collection request on behalf of the embedder. With
    /// `FinalizerErrors::Propagate` the first finalizer error is returned
    /// once the request has finished.
    pub(crate) fn explicit<T>(&mut self, request: impl FnOnce(&mut Self) -> T) -> LuaResult<T> {
        let outer = self.collect_errors;
        self.collect_errors = self.option.finalizer_errors == FinalizerErrors::Propagate;
        let out = request(self);
        self.collect_errors = outer;
        if outer {
            return Ok(out);
        }
        match self.finalizer_error.take() {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// One increment of the tracing collector, even when it is stopped.
    /// Returns true if the step finished a cycle.
    pub fn step_collector(&mut self) -> LuaResult<bool> {
        self.explicit(|heap| {
            if heap.gc.gc_stopem {
                return false;
            }
            heap.inc_step();
            heap.gc.gc_state == GcState::Pause
        })
    }

    pub fn request_full_collection(&mut self, emergency: bool) -> LuaResult<()> {
        self.explicit(|heap| heap.full_gc(emergency))
    }

    /// Scan one generation now. Returns the number of objects destroyed.
    pub fn collect_generation(&mut self, generation: usize) -> LuaResult<usize> {
        self.explicit(|heap| {
            if heap.gc.gc_stopem {
                return 0;
            }
            heap.generation_scan(generation)
        })
    }

    /// Select the reclamation strategy; returns the previous one
    pub fn set_gc_kind(&mut self, kind: GcKind) -> GcKind {
        let old = self.gc.gc_kind;
        if old != kind {
            self.gc.gc_kind = kind;
            self.alloc.gens.enabled = kind == GcKind::Generational && !self.gc.gc_stopped;
            if kind == GcKind::Incremental {
                self.gc.set_pause(&mut self.alloc);
            }
            log::debug!("gc kind {old:?} -> {kind:?}");
        }
        old
    }

    pub fn stop_collector(&mut self) {
        self.gc.gc_stopped = true;
        self.alloc.gens.enabled = false;
    }

    pub fn restart_collector(&mut self) {
        self.gc.gc_stopped = false;
        self.alloc.gens.enabled = self.gc.gc_kind == GcKind::Generational;
        self.gc.set_debt(0, self.alloc.total_bytes);
    }

    pub fn is_running(&self) -> bool {
        !self.gc.gc_stopped
    }

    pub fn set_generation_threshold(&mut self, generation: usize, threshold: usize) {
        if generation < NUM_GENERATIONS {
            self.alloc.gens.set_threshold(generation, threshold);
        }
    }
}
