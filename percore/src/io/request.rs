use std::net::SocketAddr;
use std::os::fd::RawFd;

use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u8 {
        const READABLE = 1;
        const WRITABLE = 1 << 1;
    }
}

/// One asynchronous I/O operation, owned by the submitter until the
/// backend reports completion.
#[derive(Debug)]
pub enum IoRequest {
    Read {
        fd: RawFd,
        pos: u64,
        len: usize,
    },
    Write {
        fd: RawFd,
        pos: u64,
        buf: Vec<u8>,
    },
    Readv {
        fd: RawFd,
        pos: u64,
        lens: SmallVec<[usize; 4]>,
    },
    Writev {
        fd: RawFd,
        pos: u64,
        bufs: SmallVec<[Vec<u8>; 4]>,
    },
    Fdatasync {
        fd: RawFd,
    },
    Send {
        fd: RawFd,
        buf: Vec<u8>,
    },
    SendMsg {
        fd: RawFd,
        buf: Vec<u8>,
        addr: Option<SocketAddr>,
    },
    Recv {
        fd: RawFd,
        len: usize,
    },
    RecvMsg {
        fd: RawFd,
        len: usize,
    },
    Accept {
        fd: RawFd,
    },
    Connect {
        fd: RawFd,
        addr: SocketAddr,
    },
    PollAdd {
        fd: RawFd,
        events: PollEvents,
    },
    PollRemove {
        fd: RawFd,
    },
    /// Cancels the in-flight request identified by `id`, where supported.
    Cancel {
        id: u64,
    },
}

impl IoRequest {
    /// Payload length used for bandwidth accounting.
    pub fn length(&self) -> usize {
        match self {
            IoRequest::Read { len, .. } | IoRequest::Recv { len, .. } | IoRequest::RecvMsg { len, .. } => *len,
            IoRequest::Write { buf, .. } | IoRequest::Send { buf, .. } | IoRequest::SendMsg { buf, .. } => {
                buf.len()
            }
            IoRequest::Readv { lens, .. } => lens.iter().sum(),
            IoRequest::Writev { bufs, .. } => bufs.iter().map(Vec::len).sum(),
            IoRequest::Fdatasync { .. }
            | IoRequest::Accept { .. }
            | IoRequest::Connect { .. }
            | IoRequest::PollAdd { .. }
            | IoRequest::PollRemove { .. }
            | IoRequest::Cancel { .. } => 0,
        }
    }

    /// Writes are charged at a multiple of reads in the admission budget.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            IoRequest::Write { .. }
                | IoRequest::Writev { .. }
                | IoRequest::Send { .. }
                | IoRequest::SendMsg { .. }
                | IoRequest::Fdatasync { .. }
        )
    }

    pub fn fd(&self) -> Option<RawFd> {
        match self {
            IoRequest::Read { fd, .. }
            | IoRequest::Write { fd, .. }
            | IoRequest::Readv { fd, .. }
            | IoRequest::Writev { fd, .. }
            | IoRequest::Fdatasync { fd }
            | IoRequest::Send { fd, .. }
            | IoRequest::SendMsg { fd, .. }
            | IoRequest::Recv { fd, .. }
            | IoRequest::RecvMsg { fd, .. }
            | IoRequest::Accept { fd }
            | IoRequest::Connect { fd, .. }
            | IoRequest::PollAdd { fd, .. }
            | IoRequest::PollRemove { fd } => Some(*fd),
            IoRequest::Cancel { .. } => None,
        }
    }
}
