//! Execution streams.

use std::sync::Mutex;

use crate::desc::{Arg, ScratchpadMode};
use crate::error::{PrimResult, PrimitiveError};
use crate::primitive::{ExecArgs, ExecContext, Primitive, ScratchpadGrantor};

/// In-order execution queue of an engine.
pub trait Stream: Send + Sync {
    /// Runs `primitive` against `args`. Synchronous streams return after the kernel completes.
    fn enqueue(&self, primitive: &Primitive, args: &ExecArgs) -> PrimResult<()>;

    /// Blocks until all enqueued work has finished.
    fn wait(&self) -> PrimResult<()>;
}

/// Synchronous host stream. Owns a scratch buffer, grown on demand, that backs library-mode
/// scratchpads; executions on one stream are therefore serialized.
#[derive(Default)]
pub struct SyncStream {
    scratchpad: Mutex<Vec<u8>>,
}

impl SyncStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently held by the reusable scratch buffer.
    pub fn scratchpad_capacity(&self) -> usize {
        self.scratchpad
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

fn grow(buffer: &mut Vec<u8>, size: usize) -> PrimResult<()> {
    if buffer.len() >= size {
        return Ok(());
    }
    buffer
        .try_reserve_exact(size - buffer.len())
        .map_err(|_| PrimitiveError::out_of_memory("growing the stream scratchpad", size))?;
    buffer.resize(size, 0);
    Ok(())
}

fn run(primitive: &Primitive, args: &ExecArgs, buffer: &mut [u8]) -> PrimResult<()> {
    let grantor = ScratchpadGrantor::new(primitive.pd().scratchpad_registry(), buffer)?;
    let mut ctx = ExecContext::new(args, grantor);
    primitive.kernel().execute(&mut ctx)
}

impl Stream for SyncStream {
    fn enqueue(&self, primitive: &Primitive, args: &ExecArgs) -> PrimResult<()> {
        let pd = primitive.pd();
        let size = pd.scratchpad_size();
        match pd.attr().scratchpad_mode() {
            ScratchpadMode::Library => {
                let mut buffer = self
                    .scratchpad
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                grow(&mut buffer, size)?;
                run(primitive, args, &mut buffer[..size])
            }
            ScratchpadMode::User if size == 0 => run(primitive, args, &mut []),
            ScratchpadMode::User => {
                let memory = args.get(Arg::Scratchpad).ok_or_else(|| {
                    PrimitiveError::invalid_arguments(
                        "user scratchpad mode requires Arg::Scratchpad",
                    )
                })?;
                let mut buffer = memory.write_bytes();
                run(primitive, args, &mut buffer[..])
            }
        }
    }

    fn wait(&self) -> PrimResult<()> {
        Ok(())
    }
}
