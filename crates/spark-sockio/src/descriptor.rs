//! 描述符抽象：流水线对内核套接字的全部需求只有“一次非阻塞读”“一次 vectored 写”“关闭”。

use std::{
    io::{self, IoSlice, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
};

/// 非阻塞字节流描述符。
///
/// # 契约（What）
/// - `recv`：单次非阻塞读取；`Ok(0)` 表示对端有序关闭，`WouldBlock` 表示暂无数据；
/// - `send_vectored`：单次 vectored 写，允许部分写入；
/// - `shutdown`：在描述符被释放前由套接字调用恰好一次；
/// - 实现者须保证已处于非阻塞模式，否则会阻塞事件循环。
pub trait Descriptor {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Descriptor for socket2::Socket {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(self, bufs)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        socket2::Socket::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        socket2::Socket::peer_addr(self)
            .ok()
            .and_then(|addr| addr.as_socket())
    }
}

impl Descriptor for TcpStream {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn send_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Write::write_vectored(self, bufs)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// 将已接受/已连接的 TCP 流切换为非阻塞模式后交给流水线。
pub fn nonblocking_tcp(stream: TcpStream) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::from(stream);
    socket.set_nonblocking(true)?;
    Ok(socket)
}
