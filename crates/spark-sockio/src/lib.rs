#![doc = r#"
# spark-sockio

## 设计动机（Why）
- **统一非阻塞语义**：部分读写、would-block、满额读取后的快速重读集中在 [`StreamSocket`]，
  各协议层只处理编解码；
- **可组合协议层**：明文、TLS、WebSocket 等协议以 [`Hook`] 的形式按挂载顺序叠加，
  链式引擎只依赖 `Hook` 契约；
- **单线程事件循环**：所有类型都假定只在一个反应器线程上被访问，内部不加锁。

## 核心契约（What）
- [`SendQueue`]：自有缓冲的有序队列，总字节数 O(1)，队首擦除不移动其余元素；
- [`StreamSocket`]：持有描述符、顶层缓冲与 [`HookChain`]，由 [`StreamSocket::on_event`] 驱动；
- [`Hook`]：`decode` / `encode` / `is_ready` / `on_close` 四个入口；
- [`Reactor`]：外部反应器的登记接口，流水线通过 [`Interest`] 精确描述下一次需要的就绪；
- [`SocketError`]：终态错误，携带稳定错误码、分类与可选协议关闭码。

## 实现策略（How）
- 读路径：原始读取填充链尾缓冲，随后以循环从尾到头逐层解码；
- 写路径：从头到尾逐层编码，最终以 vectored 写刷出链尾队列；
- 关闭：头到尾通知每个 Hook 一次，尽力刷写一次，再释放描述符。

## 风险与考量（Trade-offs）
- 链深度不设上限，读路径的栈深度与链长无关；
- 读缓冲按 `read_chunk` 预先清零扩展，多一次内存写以换取无 `unsafe`。
"#]

mod chain;
pub mod config;
pub mod descriptor;
pub mod error;
mod hook;
pub mod reactor;
mod send_queue;
mod socket;
/// 测试桩命名空间：内存描述符与记录型反应器，供集成测试与 Hook crate 复用。
pub mod test_stubs;

pub use chain::HookChain;
pub use config::{ConfigError, SocketConfig};
pub use descriptor::{Descriptor, nonblocking_tcp};
pub use error::{ErrorKind, Result, SocketError};
pub use hook::{DecodeOutcome, EncodeOutcome, Hook, HookContext};
pub use reactor::{Interest, Reactor, Readiness, Token};
pub use send_queue::SendQueue;
pub use socket::{MAX_IOV, StreamHandler, StreamSocket};
