//! Alignment-safe write engine
//!
//! Drives each client write through an explicit state machine: geometry
//! lookup, edge check, pre-read buffer assembly, range lock, pre-read,
//! write, completion. Fully aligned writes skip straight from the edge
//! check to the write with no lock and no pre-read; they carry no ordering
//! guarantee relative to each other or to in-flight read-modify-write
//! sequences. On any state failure the machine jumps to `Complete` with
//! the error recorded; completion is signalled to the caller exactly once
//! on every path.

use crate::directory::Directory;
use crate::geometry::GeometryCache;
use crate::metrics::EngineStats;
use crate::pool::{BlockPool, PoolBlock, SgList};
use crate::rangelock::{LockAttempt, RangeLockManager, Ticket};
use crate::service::{PhysicalService, PreReadDescriptor};
use crate::status;
use blockrelay_common::{
    BlockCount, BlockGeometry, DiagnosticBuffer, Error, IoCompletion, IoOutcome, Lba, Result,
    SlotId, TransportStatus,
};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// States of the write machine, in nominal order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteState {
    Start,
    CheckEdge,
    AllocatePreRead,
    InitSgl,
    LockRange,
    PreRead,
    PreReadCleanup,
    IssueWrite,
    Complete,
}

/// Transition function: advance on success, jump to `Complete` on failure.
///
/// Two states bend the rule: `CheckEdge` uses the failure edge to mean
/// "already aligned, go straight to the write", and a pre-read failure is
/// non-fatal — the write is still issued with whatever was read.
const fn next_state(state: WriteState, advance: bool) -> WriteState {
    use WriteState::{
        AllocatePreRead, CheckEdge, Complete, InitSgl, IssueWrite, LockRange, PreRead,
        PreReadCleanup, Start,
    };
    match (state, advance) {
        (Start, true) => CheckEdge,
        (CheckEdge, true) => AllocatePreRead,
        (CheckEdge, false) => IssueWrite,
        (AllocatePreRead, true) => InitSgl,
        (InitSgl, true) => LockRange,
        (LockRange, true) => PreRead,
        (PreRead, _) => PreReadCleanup,
        (PreReadCleanup, _) => IssueWrite,
        (IssueWrite, _) | (Complete, _) | (_, false) => Complete,
    }
}

/// Result and diagnostics for one completed request.
pub(crate) struct CompletionRecord {
    pub(crate) result: Result<IoOutcome>,
    pub(crate) diagnostics: DiagnosticBuffer,
}

impl CompletionRecord {
    fn failed(error: Error) -> Self {
        Self {
            result: Err(error),
            diagnostics: DiagnosticBuffer::default(),
        }
    }
}

/// One in-flight client write.
///
/// Owns its pre-read buffers and scatter list outright; everything is
/// released when the context is dropped at completion. While parked on a
/// slot's lock list the context is owned by its waiter entry.
pub struct WriteContext {
    pub(crate) slot: SlotId,
    pub(crate) lba: Lba,
    pub(crate) block_count: BlockCount,
    pub(crate) data: Bytes,
    pub(crate) state: WriteState,
    pub(crate) geometry: Option<BlockGeometry>,

    // Pre-read range, rounded outward to optimal-block boundaries.
    pub(crate) pre_read_lba: Lba,
    pub(crate) pre_read_blocks: BlockCount,
    pub(crate) start_aligned: bool,
    pub(crate) end_aligned: bool,
    pub(crate) pre_read_required: bool,

    pub(crate) begin_edge: Option<PoolBlock>,
    pub(crate) end_edge: Option<PoolBlock>,
    pub(crate) dummy: Option<PoolBlock>,
    pub(crate) sgl: Option<SgList>,

    pub(crate) ticket: Option<Ticket>,
    pub(crate) region_locked: bool,

    pub(crate) write_completion: Option<IoCompletion>,
    pub(crate) failure: Option<Error>,
    completion_tx: Option<oneshot::Sender<CompletionRecord>>,
}

impl WriteContext {
    fn new(
        slot: SlotId,
        lba: Lba,
        block_count: BlockCount,
        data: Bytes,
        completion_tx: oneshot::Sender<CompletionRecord>,
    ) -> Box<Self> {
        Box::new(Self {
            slot,
            lba,
            block_count,
            data,
            state: WriteState::Start,
            geometry: None,
            pre_read_lba: lba,
            pre_read_blocks: block_count,
            start_aligned: true,
            end_aligned: true,
            pre_read_required: false,
            begin_edge: None,
            end_edge: None,
            dummy: None,
            sgl: None,
            ticket: None,
            region_locked: false,
            write_completion: None,
            failure: None,
            completion_tx: Some(completion_tx),
        })
    }

    /// Range the lock must cover: the pre-read range.
    #[must_use]
    pub(crate) fn pre_read_range(&self) -> (Lba, BlockCount) {
        (self.pre_read_lba, self.pre_read_blocks)
    }

    /// Record the first failure; later failures keep the original cause.
    fn fail(&mut self, error: Error) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn send_completion(&mut self, record: CompletionRecord) {
        if let Some(tx) = self.completion_tx.take() {
            // A caller that stopped waiting only loses its own result.
            let _ = tx.send(record);
        }
    }

    #[cfg(test)]
    pub(crate) fn stub(slot: SlotId, lba: Lba, block_count: BlockCount) -> Box<Self> {
        let (tx, _rx) = oneshot::channel();
        let mut context = Self::new(slot, lba, block_count, Bytes::new(), tx);
        context.pre_read_required = true;
        context
    }
}

/// The write engine and read path over one physical service.
pub struct WriteEngine {
    service: Arc<dyn PhysicalService>,
    directory: Arc<Directory>,
    geometry: GeometryCache,
    pool: BlockPool,
    locks: RangeLockManager,
    stats: Arc<EngineStats>,
    io_timeout: Duration,
}

impl WriteEngine {
    pub(crate) fn new(
        service: Arc<dyn PhysicalService>,
        directory: Arc<Directory>,
        geometry: GeometryCache,
        pool: BlockPool,
        locks: RangeLockManager,
        stats: Arc<EngineStats>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            service,
            directory,
            geometry,
            pool,
            locks,
            stats,
            io_timeout,
        }
    }

    #[must_use]
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Submit one client write and wait for its completion record.
    pub(crate) async fn submit_write(
        &self,
        slot: SlotId,
        lba: Lba,
        block_count: BlockCount,
        data: Bytes,
    ) -> CompletionRecord {
        EngineStats::bump(&self.stats.writes);
        if let Err(error) = self.validate_request(slot, lba, block_count, Some(&data)) {
            EngineStats::bump(&self.stats.failures);
            return CompletionRecord::failed(error);
        }

        let (tx, rx) = oneshot::channel();
        let context = WriteContext::new(slot, lba, block_count, data, tx);
        self.run(context).await;

        match rx.await {
            Ok(record) => record,
            Err(_) => CompletionRecord::failed(Error::IoFailed),
        }
    }

    /// Capacity of the device behind a slot, in client blocks.
    pub(crate) async fn capacity(&self, slot: SlotId) -> Result<u64> {
        self.directory.slot(slot)?;
        let object_id = self.directory.resolve(slot).ok_or(Error::NotReady)?;
        match tokio::time::timeout(self.io_timeout, self.service.capacity(object_id)).await {
            Ok(result) => result,
            Err(_) => {
                EngineStats::bump(&self.stats.timeouts);
                Err(Error::Timeout)
            }
        }
    }

    /// Submit one client read.
    pub(crate) async fn submit_read(
        &self,
        slot: SlotId,
        lba: Lba,
        block_count: BlockCount,
    ) -> Result<Bytes> {
        EngineStats::bump(&self.stats.reads);
        let result = self.read_inner(slot, lba, block_count).await;
        if result.is_err() {
            EngineStats::bump(&self.stats.failures);
        }
        result
    }

    async fn read_inner(&self, slot: SlotId, lba: Lba, block_count: BlockCount) -> Result<Bytes> {
        self.validate_request(slot, lba, block_count, None)?;
        let geometry = self.geometry.get(slot).await?;
        let end = lba
            .checked_add(block_count)
            .ok_or_else(|| Error::InvalidParameter("lba range overflows".to_string()))?;
        if end > geometry.block_count {
            return Err(Error::InvalidRequest(format!(
                "read [{lba}, {end}) beyond capacity {}",
                geometry.block_count
            )));
        }
        let object_id = self.directory.resolve(slot).ok_or(Error::NotReady)?;

        let len = (block_count * u64::from(geometry.block_size)) as usize;
        let mut sgl = SgList::new();
        let buffer = sgl.push_heap(vec![0u8; len].into_boxed_slice());
        sgl.push_element(buffer, len);

        let completion = match tokio::time::timeout(
            self.io_timeout,
            self.service.read(object_id, lba, block_count, &mut sgl),
        )
        .await
        {
            Ok(completion) => completion,
            Err(_) => {
                EngineStats::bump(&self.stats.timeouts);
                IoCompletion::transport_error(TransportStatus::TimedOut)
            }
        };

        let mut diagnostics = DiagnosticBuffer::default();
        status::translate(&completion, &mut diagnostics)?;

        let mut out = vec![0u8; len];
        sgl.copy_out(0, &mut out)?;
        Ok(Bytes::from(out))
    }

    fn validate_request(
        &self,
        slot: SlotId,
        _lba: Lba,
        block_count: BlockCount,
        data: Option<&Bytes>,
    ) -> Result<()> {
        self.directory.slot(slot)?;
        if block_count == 0 {
            return Err(Error::InvalidParameter("zero-length request".to_string()));
        }
        if let Some(data) = data {
            if data.is_empty() {
                return Err(Error::InvalidParameter("empty write buffer".to_string()));
            }
        }
        Ok(())
    }

    /// Run the state machine until the context completes or parks on a
    /// range lock.
    async fn run(&self, mut context: Box<WriteContext>) {
        loop {
            let advance = match context.state {
                WriteState::Start => self.step_start(&mut context).await,
                WriteState::CheckEdge => self.step_check_edge(&mut context),
                WriteState::AllocatePreRead => self.step_allocate_pre_read(&mut context),
                WriteState::InitSgl => self.step_init_sgl(&mut context),
                WriteState::LockRange => match self.step_lock_range(context) {
                    Some(locked) => {
                        context = locked;
                        true
                    }
                    // Parked; the retry worker resumes it on grant.
                    None => return,
                },
                WriteState::PreRead => self.step_pre_read(&mut context).await,
                WriteState::PreReadCleanup => true,
                WriteState::IssueWrite => self.step_issue_write(&mut context).await,
                WriteState::Complete => {
                    self.step_complete(context);
                    return;
                }
            };
            context.state = next_state(context.state, advance);
        }
    }

    /// Re-dispatch a context whose range lock was just granted.
    pub(crate) async fn resume(&self, mut context: Box<WriteContext>) {
        debug_assert!(context.region_locked);
        context.state = next_state(WriteState::LockRange, true);
        self.run(context).await;
    }

    async fn step_start(&self, context: &mut WriteContext) -> bool {
        let geometry = match self.geometry.get(context.slot).await {
            Ok(geometry) => geometry,
            Err(error) => {
                context.fail(error);
                return false;
            }
        };

        let Some(end) = context.lba.checked_add(context.block_count) else {
            context.fail(Error::InvalidParameter("lba range overflows".to_string()));
            return false;
        };
        if end > geometry.block_count {
            context.fail(Error::InvalidRequest(format!(
                "write [{}, {end}) beyond capacity {}",
                context.lba, geometry.block_count
            )));
            return false;
        }
        let expected = context.block_count * u64::from(geometry.block_size);
        if context.data.len() as u64 != expected {
            context.fail(Error::InvalidParameter(format!(
                "buffer is {} bytes, {} blocks need {expected}",
                context.data.len(),
                context.block_count
            )));
            return false;
        }

        context.geometry = Some(geometry);
        true
    }

    /// Compute edge alignment and the outward-rounded pre-read range.
    /// Advancing on the failure edge means "aligned, no pre-read".
    fn step_check_edge(&self, context: &mut WriteContext) -> bool {
        let Some(geometry) = context.geometry else {
            context.fail(Error::IoFailed);
            return false;
        };
        let opt = geometry.lbas_per_optimal_block();
        let align = u64::from(geometry.optimal_block_alignment) % opt;
        let offset_into_opt = |lba: Lba| (lba + opt - align) % opt;

        let end = context.lba + context.block_count;
        let start_offset = offset_into_opt(context.lba);
        let end_offset = offset_into_opt(end);
        context.start_aligned = start_offset == 0;
        context.end_aligned = end_offset == 0;

        if context.start_aligned && context.end_aligned {
            EngineStats::bump(&self.stats.aligned_writes);
            context.pre_read_required = false;
            return false;
        }

        context.pre_read_lba = context.lba - start_offset;
        let rounded_end = if context.end_aligned {
            end
        } else {
            (end + opt - end_offset).min(geometry.block_count)
        };
        context.pre_read_blocks = rounded_end - context.pre_read_lba;
        context.pre_read_required = true;
        EngineStats::bump(&self.stats.rmw_writes);
        debug!(
            slot = %context.slot,
            lba = context.lba,
            blocks = context.block_count,
            pre_read_lba = context.pre_read_lba,
            pre_read_blocks = context.pre_read_blocks,
            "unaligned write needs pre-read"
        );
        true
    }

    /// Take the pooled edge and dummy buffers. Nothing is locked yet, so a
    /// failed allocation just completes the request with the pool error.
    fn step_allocate_pre_read(&self, context: &mut WriteContext) -> bool {
        let Some(geometry) = context.geometry else {
            context.fail(Error::IoFailed);
            return false;
        };
        if geometry.optimal_block_size as usize > self.pool.buffer_bytes() {
            context.fail(Error::InvalidRequest(format!(
                "optimal block {} exceeds pool buffer {}",
                geometry.optimal_block_size,
                self.pool.buffer_bytes()
            )));
            return false;
        }

        match self.take_pre_read_buffers(!context.start_aligned, !context.end_aligned) {
            Ok((begin, dummy, end)) => {
                context.begin_edge = begin;
                context.dummy = Some(dummy);
                context.end_edge = end;
                true
            }
            Err(error) => {
                context.fail(error);
                false
            }
        }
    }

    fn take_pre_read_buffers(
        &self,
        begin_needed: bool,
        end_needed: bool,
    ) -> Result<(Option<PoolBlock>, PoolBlock, Option<PoolBlock>)> {
        let begin = if begin_needed {
            Some(self.pool.take()?)
        } else {
            None
        };
        let dummy = self.pool.take()?;
        let end = if end_needed {
            Some(self.pool.take()?)
        } else {
            None
        };
        Ok((begin, dummy, end))
    }

    /// Build the scatter list: the begin-edge buffer covers the head run,
    /// the dummy buffer is repeated per covered middle block, and the
    /// end-edge buffer covers the tail run.
    fn step_init_sgl(&self, context: &mut WriteContext) -> bool {
        let Some(geometry) = context.geometry else {
            context.fail(Error::IoFailed);
            return false;
        };
        let block_size = geometry.block_size as usize;
        let head_blocks = context.lba - context.pre_read_lba;
        let pre_read_end = context.pre_read_lba + context.pre_read_blocks;
        let tail_blocks = pre_read_end - (context.lba + context.block_count);
        let covered_blocks = context.pre_read_blocks - head_blocks - tail_blocks;

        let Some(dummy) = context.dummy.take() else {
            context.fail(Error::IoFailed);
            return false;
        };

        let mut sgl = SgList::new();
        if head_blocks > 0 {
            let Some(begin) = context.begin_edge.take() else {
                context.fail(Error::IoFailed);
                return false;
            };
            let buffer = sgl.push_pooled(begin);
            sgl.push_element(buffer, head_blocks as usize * block_size);
        }
        let dummy_buffer = sgl.push_pooled(dummy);
        for _ in 0..covered_blocks {
            sgl.push_element(dummy_buffer, block_size);
        }
        if tail_blocks > 0 {
            let Some(end) = context.end_edge.take() else {
                context.fail(Error::IoFailed);
                return false;
            };
            let buffer = sgl.push_pooled(end);
            sgl.push_element(buffer, tail_blocks as usize * block_size);
        }

        context.sgl = Some(sgl);
        true
    }

    fn step_lock_range(&self, context: Box<WriteContext>) -> Option<Box<WriteContext>> {
        let slot = match self.directory.slot(context.slot) {
            Ok(slot) => slot,
            Err(error) => {
                // Slot index was validated at submit; complete defensively.
                let mut context = context;
                context.fail(error);
                context.state = WriteState::Complete;
                self.step_complete(context);
                return None;
            }
        };
        match self.locks.lock(slot, context) {
            LockAttempt::Locked(context) => {
                EngineStats::bump(&self.stats.locks_granted);
                Some(context)
            }
            LockAttempt::Queued => {
                EngineStats::bump(&self.stats.locks_queued);
                None
            }
        }
    }

    /// Issue the pre-read. Completion, success or failure, always advances:
    /// the write is still issued with whatever edge data was read.
    async fn step_pre_read(&self, context: &mut WriteContext) -> bool {
        EngineStats::bump(&self.stats.pre_reads);
        let completion = match self.directory.resolve(context.slot) {
            Some(object_id) => {
                let Some(sgl) = context.sgl.as_mut() else {
                    context.fail(Error::IoFailed);
                    return false;
                };
                match tokio::time::timeout(
                    self.io_timeout,
                    self.service.read(
                        object_id,
                        context.pre_read_lba,
                        context.pre_read_blocks,
                        sgl,
                    ),
                )
                .await
                {
                    Ok(completion) => completion,
                    Err(_) => {
                        EngineStats::bump(&self.stats.timeouts);
                        IoCompletion::transport_error(TransportStatus::TimedOut)
                    }
                }
            }
            None => IoCompletion::transport_error(TransportStatus::NoSuchDevice),
        };

        if !completion.is_success() {
            EngineStats::bump(&self.stats.pre_read_failures);
            warn!(
                slot = %context.slot,
                pre_read_lba = context.pre_read_lba,
                ?completion,
                "pre-read failed; issuing write with partial edge data"
            );
        }
        true
    }

    async fn step_issue_write(&self, context: &mut WriteContext) -> bool {
        let Some(object_id) = self.directory.resolve(context.slot) else {
            context.write_completion =
                Some(IoCompletion::transport_error(TransportStatus::NoSuchDevice));
            return false;
        };

        let pre_read = context.sgl.as_ref().map(|sg_list| PreReadDescriptor {
            lba: context.pre_read_lba,
            block_count: context.pre_read_blocks,
            sg_list,
        });

        let completion = match tokio::time::timeout(
            self.io_timeout,
            self.service.write(
                object_id,
                context.lba,
                context.block_count,
                &context.data,
                pre_read,
            ),
        )
        .await
        {
            Ok(completion) => completion,
            Err(_) => {
                EngineStats::bump(&self.stats.timeouts);
                IoCompletion::transport_error(TransportStatus::TimedOut)
            }
        };

        let ok = completion.is_success();
        context.write_completion = Some(completion);
        ok
    }

    /// Release the lock if held, return pooled memory, translate the
    /// outcome, and signal the caller. Every path through the machine ends
    /// here exactly once.
    fn step_complete(&self, mut context: Box<WriteContext>) {
        if context.region_locked {
            if let (Some(ticket), Ok(slot)) = (context.ticket, self.directory.slot(context.slot)) {
                self.locks.unlock(slot, ticket);
            }
            context.region_locked = false;
        }

        context.sgl = None;
        context.begin_edge = None;
        context.end_edge = None;
        context.dummy = None;

        let mut diagnostics = DiagnosticBuffer::default();
        let result = if let Some(error) = context.failure.take() {
            Err(error)
        } else if let Some(completion) = context.write_completion {
            status::translate(&completion, &mut diagnostics)
        } else {
            warn!(slot = %context.slot, "write completed without a completion record");
            Err(Error::IoFailed)
        };

        if result.is_err() {
            EngineStats::bump(&self.stats.failures);
        }
        context.send_completion(CompletionRecord {
            result,
            diagnostics,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_contract() {
        use WriteState::*;
        assert_eq!(next_state(Start, true), CheckEdge);
        assert_eq!(next_state(Start, false), Complete);
        assert_eq!(next_state(CheckEdge, true), AllocatePreRead);
        assert_eq!(next_state(CheckEdge, false), IssueWrite);
        assert_eq!(next_state(AllocatePreRead, false), Complete);
        assert_eq!(next_state(InitSgl, true), LockRange);
        assert_eq!(next_state(LockRange, true), PreRead);
        // Pre-read failure is non-fatal.
        assert_eq!(next_state(PreRead, false), PreReadCleanup);
        assert_eq!(next_state(PreReadCleanup, true), IssueWrite);
        assert_eq!(next_state(IssueWrite, true), Complete);
        assert_eq!(next_state(IssueWrite, false), Complete);
    }
}
