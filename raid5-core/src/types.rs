// vim: tw=80
//! Common type definitions used throughout the RAID engine

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::{FromPrimitive, ToPrimitive};
use thiserror::Error;
use std::io;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a 512-byte sector, the granularity of the upstream block interface.
pub type SectorT = u64;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Mutable version of `SGList`.  Uniquely owned.
pub type SGListMut = Vec<IoVecMut>;

/// The engine's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq, Primitive)]
pub enum Error {
    // Standard errnos
    #[error("Operation not permitted")]
    EPERM           = libc::EPERM as isize,
    #[error("No such file or directory")]
    ENOENT          = libc::ENOENT as isize,
    #[error("Interrupted system call")]
    EINTR           = libc::EINTR as isize,
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Bad file descriptor")]
    EBADF           = libc::EBADF as isize,
    #[error("Cannot allocate memory")]
    ENOMEM          = libc::ENOMEM as isize,
    #[error("Permission denied")]
    EACCES          = libc::EACCES as isize,
    #[error("Bad address")]
    EFAULT          = libc::EFAULT as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("File exists")]
    EEXIST          = libc::EEXIST as isize,
    #[error("Operation not supported by device")]
    ENODEV          = libc::ENODEV as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Illegal seek")]
    ESPIPE          = libc::ESPIPE as isize,
    #[error("Read-only file system")]
    EROFS           = libc::EROFS as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Result too large")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Value too large to be stored in data type")]
    EOVERFLOW       = libc::EOVERFLOW as isize,
    #[error("Operation canceled")]
    ECANCELED       = libc::ECANCELED as isize,

    //// Custom error types below
    /// An internal invariant was violated.  This indicates a logic defect,
    /// never an environmental fault, and the affected unit stops rather than
    /// continue with corrupted bookkeeping.
    #[error("Programming error")]
    EDOOFUS         = 256,
    #[error("Unknown error")]
    EUNKNOWN        = 257,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            _ => e.to_i32().unwrap()
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// LCOV_EXCL_STOP
