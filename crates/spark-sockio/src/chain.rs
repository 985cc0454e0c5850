//! Hook 链：按挂载顺序排列的槽位序列。
//!
//! # 教案级注释
//!
//! ## 逻辑（How）
//! - 下标 0 为链头（最靠近应用），末尾为链尾（最靠近线路）；挂载即 `push`，无需遍历到尾部；
//! - 每个槽位持有 Hook 及其私有接收缓冲、发送队列；
//! - 读路径：原始读取填充链尾的接收缓冲，随后从尾到头逐层解码，每层输出写入上一层的接收缓冲，
//!   链头输出写入套接字顶层缓冲。以循环实现，栈深度与链长无关；
//! - 写路径：从头到尾逐层编码，每层以上一层的发送队列为输入（链头以顶层队列为输入），
//!   最终由套接字刷写链尾队列。
//!
//! ## 契约（What）
//! - 一个 Hook 返回 `Blocked` 只表示“暂不接收上层数据”，它已产出的字节仍会经下层送往线路，
//!   因此握手记录可以在应用数据被扣留时照常发出。

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::{
    hook::{DecodeOutcome, EncodeOutcome, Hook, HookContext},
    send_queue::SendQueue,
};

struct HookSlot {
    hook: Box<dyn Hook>,
    recvq: BytesMut,
    sendq: SendQueue,
}

/// 套接字持有的有序 Hook 序列。
#[derive(Default)]
pub struct HookChain {
    slots: Vec<HookSlot>,
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在链尾（靠近线路的一端）追加 Hook。
    pub fn attach(&mut self, hook: Box<dyn Hook>) {
        debug!(hook = hook.name(), position = self.slots.len(), "hook attached");
        self.slots.push(HookSlot {
            hook,
            recvq: BytesMut::new(),
            sendq: SendQueue::new(),
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 所有 Hook 均完成握手/升级。
    pub fn is_ready(&self) -> bool {
        self.slots.iter().all(|slot| slot.hook.is_ready())
    }

    /// 按头到尾顺序遍历 Hook。
    pub fn hooks(&self) -> impl Iterator<Item = &dyn Hook> {
        self.slots.iter().map(|slot| slot.hook.as_ref())
    }

    pub fn find<T: Hook>(&self) -> Option<&T> {
        self.slots
            .iter()
            .find_map(|slot| slot.hook.as_ref().downcast_ref::<T>())
    }

    pub fn find_mut<T: Hook>(&mut self) -> Option<&mut T> {
        self.slots
            .iter_mut()
            .find_map(|slot| slot.hook.as_mut().downcast_mut::<T>())
    }

    /// 链上任一 Hook 的发送队列中仍有待发字节，或 Hook 自身请求写入。
    pub(crate) fn has_pending_output(&self) -> bool {
        self.slots
            .iter()
            .any(|slot| !slot.sendq.is_empty() || slot.hook.wants_write())
    }

    /// 原始读取的目标缓冲：链尾的私有接收缓冲。
    pub(crate) fn wire_recvq(&mut self) -> Option<&mut BytesMut> {
        self.slots.last_mut().map(|slot| &mut slot.recvq)
    }

    /// 需要刷写到描述符的队列：链尾的发送队列，空链时为顶层队列。
    pub(crate) fn wire_sendq<'q>(&'q mut self, top: &'q mut SendQueue) -> &'q mut SendQueue {
        match self.slots.last_mut() {
            Some(slot) => &mut slot.sendq,
            None => top,
        }
    }

    /// 从链尾到链头逐层解码，返回链头的结果。
    pub(crate) fn decode_upward(
        &mut self,
        ctx: &mut HookContext<'_>,
        top: &mut BytesMut,
    ) -> DecodeOutcome {
        for index in (0..self.slots.len()).rev() {
            let (upper, rest) = self.slots.split_at_mut(index);
            let slot = &mut rest[0];
            let output = match upper.last_mut() {
                Some(above) => &mut above.recvq,
                None => &mut *top,
            };
            let outcome = slot
                .hook
                .decode(ctx, &mut slot.recvq, output, &mut slot.sendq);
            trace!(hook = slot.hook.name(), ?outcome, "decode step");
            match outcome {
                DecodeOutcome::Produced => continue,
                DecodeOutcome::NoProgress | DecodeOutcome::Fatal => return outcome,
            }
        }
        DecodeOutcome::Produced
    }

    /// 从链头到链尾逐层编码。
    pub(crate) fn encode_downward(
        &mut self,
        ctx: &mut HookContext<'_>,
        top: &mut SendQueue,
    ) -> EncodeOutcome {
        let mut result = EncodeOutcome::Progress;
        for index in 0..self.slots.len() {
            let (upper, rest) = self.slots.split_at_mut(index);
            let slot = &mut rest[0];
            let input = match upper.last_mut() {
                Some(above) => &mut above.sendq,
                None => &mut *top,
            };
            let outcome = slot.hook.encode(ctx, input, &mut slot.sendq);
            trace!(hook = slot.hook.name(), ?outcome, "encode step");
            match outcome {
                EncodeOutcome::Fatal => return EncodeOutcome::Fatal,
                EncodeOutcome::Blocked => result = EncodeOutcome::Blocked,
                EncodeOutcome::Progress => {}
            }
        }
        result
    }

    /// 头到尾通知关闭。
    pub(crate) fn notify_close(&mut self, ctx: &mut HookContext<'_>, top: &mut SendQueue) {
        for index in 0..self.slots.len() {
            let (upper, rest) = self.slots.split_at_mut(index);
            let slot = &mut rest[0];
            let input = match upper.last_mut() {
                Some(above) => &mut above.sendq,
                None => &mut *top,
            };
            debug!(hook = slot.hook.name(), "hook close notification");
            slot.hook.on_close(ctx, input, &mut slot.sendq);
        }
    }
}
