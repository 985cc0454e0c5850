//! 待发送缓冲队列。
//!
//! # 设计概要（How）
//! - 元素为不可变的 [`Bytes`]，头部擦除通过 `Bytes::advance` 完成，不移动也不重新分配其余元素；
//! - 总字节数随增删同步维护，`bytes()` 为 O(1)；
//! - 空缓冲永不入队，因此队首永远不会是零长度元素。

use std::{collections::VecDeque, io::IoSlice};

use bytes::{Buf, Bytes, BytesMut};

/// 有序、自有的待发送缓冲集合。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SendQueue {
    elements: VecDeque<Bytes>,
    bytes: usize,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个缓冲；空缓冲被忽略。
    pub fn push_back(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        self.bytes += data.len();
        self.elements.push_back(data);
    }

    /// 将另一个队列的全部元素按序移入本队列末尾。
    pub fn append(&mut self, other: &mut SendQueue) {
        self.bytes += other.bytes;
        self.elements.append(&mut other.elements);
        other.bytes = 0;
    }

    pub fn front(&self) -> Option<&Bytes> {
        self.elements.front()
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        let element = self.elements.pop_front()?;
        self.bytes -= element.len();
        Some(element)
    }

    /// 从队首擦除 `n` 个字节。
    ///
    /// - 若 `n` 落在某个元素内部，则只推进该元素的起点；
    /// - `n` 超过总字节数时等价于清空。
    pub fn erase_front(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.elements.front_mut() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                self.bytes -= front.len();
                self.elements.pop_front();
            } else {
                front.advance(n);
                self.bytes -= n;
                n = 0;
            }
        }
    }

    /// 队列中剩余的总字节数。
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// 元素个数。
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn clear(&mut self) {
        self.elements.clear();
        self.bytes = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.elements.iter()
    }

    /// 合并队首若干小元素，使首元素尽量接近 `target` 字节。
    ///
    /// 仅做整元素合并：首元素已达到 `target`，或下一个元素会使合并结果超过 `target` 时停止。
    /// 纯压缩操作，字节序列与总长度均不变。
    pub fn coalesce_front(&mut self, target: usize) {
        if self.elements.len() < 2 {
            return;
        }
        let first = self.elements[0].len();
        if first >= target || first + self.elements[1].len() > target {
            return;
        }

        let mut merged = BytesMut::with_capacity(target.min(self.bytes));
        while let Some(front) = self.elements.front() {
            if merged.len() + front.len() > target {
                break;
            }
            merged.extend_from_slice(front);
            self.elements.pop_front();
        }
        self.elements.push_front(merged.freeze());
    }

    /// 借出至多 `max` 个队首元素，供一次 vectored 写使用。
    pub fn io_slices(&self, max: usize) -> Vec<IoSlice<'_>> {
        self.elements
            .iter()
            .take(max)
            .map(|element| IoSlice::new(element))
            .collect()
    }

    /// 将全部内容拷贝为连续字节，主要用于诊断与测试。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut flat = Vec::with_capacity(self.bytes);
        for element in &self.elements {
            flat.extend_from_slice(element);
        }
        flat
    }
}
