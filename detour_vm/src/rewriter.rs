//! Stack rewriting during a hook install.
//!
//! Every live frame, and every inlined-frame entry, that still names the
//! hooked method is switched to its backup. In-flight calls then finish
//! against the original behaviour: a deoptimization or exception lookup
//! consults the frame's method, which is now the backup.

use detour_runtime::MethodRef;
use tracing::debug;

use crate::instrumentation::Instrumentation;
use crate::safepoint::ScopedWorldStop;
use crate::thread::ManagedThread;
use crate::thread_list::ThreadList;

/// Rewrites frame method references on one thread.
///
/// Returns the number of references changed.
pub fn replace_method_on_thread(
    _world: &ScopedWorldStop<'_>,
    thread: &ManagedThread,
    search: &MethodRef,
    replace: &MethodRef,
) -> usize {
    let rewritten = thread.with_stack(|stack| {
        let mut rewritten = 0;
        for frame in stack.frames.iter_mut() {
            if frame.method == *search {
                frame.method = replace.clone();
                rewritten += 1;
            }
            for inlined in frame.inlined.iter_mut() {
                if *inlined == *search {
                    *inlined = replace.clone();
                    rewritten += 1;
                }
            }
        }
        rewritten
    });
    thread.stats().record_rewritten(rewritten);
    rewritten
}

/// Rewrite every thread, then resynchronise its instrumentation records.
pub fn replace_method_on_all_stacks(
    world: &ScopedWorldStop<'_>,
    threads: &ThreadList,
    instrumentation: &Instrumentation,
    search: &MethodRef,
    replace: &MethodRef,
) -> usize {
    let mut total = 0;
    threads.for_each(|thread| {
        let rewritten = replace_method_on_thread(world, thread, search, replace);
        if rewritten > 0 {
            debug!(
                thread = thread.id(),
                rewritten,
                method = %search.pretty_method(),
                "rewrote frames"
            );
        }
        instrumentation.instrument_thread_stack(thread);
        total += rewritten;
    });
    total
}
