//! 反应器契约：流水线只消费“登记兴趣 / 注销”两个动作，不关心具体的 epoll/kqueue 实现。
//!
//! # 契约（What）
//! - [`Reactor::request`]：按位组合的 [`Interest`] 描述下一次需要的就绪通知；
//! - [`Reactor::deregister`]：关闭描述符前调用一次；
//! - 就绪事件由外部以 [`Readiness`] 交还给 [`StreamSocket::on_event`](crate::StreamSocket::on_event)。
//!
//! 流水线只记录“是否发生过满额读取”，不假设反应器是边沿触发还是水平触发。

use std::{fmt, io, ops};

/// 反应器分配给套接字的稳定标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(pub usize);

/// 就绪兴趣位集合。
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Interest(u16);

impl Interest {
    pub const NONE: Interest = Interest(0);
    /// 水平触发的读兴趣。
    pub const WANT_POLL_READ: Interest = Interest(1 << 0);
    /// 尽快再次读取（很可能仍有数据）。
    pub const WANT_FAST_READ: Interest = Interest(1 << 1);
    /// 边沿触发的读兴趣。
    pub const WANT_EDGE_READ: Interest = Interest(1 << 2);
    /// 读取返回了 would-block，需要等待下一次读就绪。
    pub const READ_WILL_BLOCK: Interest = Interest(1 << 3);
    /// 不再关心写就绪。
    pub const WANT_NO_WRITE: Interest = Interest(1 << 4);
    /// 水平触发的写兴趣。
    pub const WANT_POLL_WRITE: Interest = Interest(1 << 5);
    /// 一次性写就绪通知，触发后需重新登记。
    pub const WANT_SINGLE_WRITE: Interest = Interest(1 << 6);
    /// 写入返回了 would-block。
    pub const WRITE_WILL_BLOCK: Interest = Interest(1 << 7);
    /// 在本轮事件循环结束前尝试一次读取。
    pub const ADD_TRIAL_READ: Interest = Interest(1 << 8);
    /// 在本轮事件循环结束前尝试一次写入。
    pub const ADD_TRIAL_WRITE: Interest = Interest(1 << 9);

    const NAMES: [(Interest, &'static str); 10] = [
        (Self::WANT_POLL_READ, "WANT_POLL_READ"),
        (Self::WANT_FAST_READ, "WANT_FAST_READ"),
        (Self::WANT_EDGE_READ, "WANT_EDGE_READ"),
        (Self::READ_WILL_BLOCK, "READ_WILL_BLOCK"),
        (Self::WANT_NO_WRITE, "WANT_NO_WRITE"),
        (Self::WANT_POLL_WRITE, "WANT_POLL_WRITE"),
        (Self::WANT_SINGLE_WRITE, "WANT_SINGLE_WRITE"),
        (Self::WRITE_WILL_BLOCK, "WRITE_WILL_BLOCK"),
        (Self::ADD_TRIAL_READ, "ADD_TRIAL_READ"),
        (Self::ADD_TRIAL_WRITE, "ADD_TRIAL_WRITE"),
    ];

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// 是否包含任意读方向的请求。
    pub const fn wants_read(self) -> bool {
        self.0
            & (Self::WANT_POLL_READ.0
                | Self::WANT_FAST_READ.0
                | Self::WANT_EDGE_READ.0
                | Self::READ_WILL_BLOCK.0
                | Self::ADD_TRIAL_READ.0)
            != 0
    }

    /// 是否包含任意写方向的请求。
    pub const fn wants_write(self) -> bool {
        self.0
            & (Self::WANT_POLL_WRITE.0
                | Self::WANT_SINGLE_WRITE.0
                | Self::WRITE_WILL_BLOCK.0
                | Self::ADD_TRIAL_WRITE.0)
            != 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.union(rhs)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// 反应器交还给套接字的就绪事件。
#[derive(Debug)]
pub enum Readiness {
    Read,
    Write,
    /// 反应器观测到的套接字错误（如 `EPOLLERR` 时取出的 `SO_ERROR`）。
    Error(io::Error),
}

/// 外部反应器的登记接口。
///
/// 整个流水线运行在单个事件循环线程上，因此接口以 `&mut self` 调用、无需 `Send`。
pub trait Reactor {
    /// 首次登记描述符。
    fn register(&mut self, token: Token, interest: Interest) -> io::Result<()>;

    /// 调整后续需要的就绪通知。
    fn request(&mut self, token: Token, interest: Interest);

    /// 注销描述符，关闭前调用一次。
    fn deregister(&mut self, token: Token);
}
