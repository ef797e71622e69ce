// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Error codes reported by the DMA buffer device.
//!
//! Every failure falls into one of four families: resource exhaustion,
//! registration rejected by the host, unsupported control operation, and
//! access failures towards the caller. Each [`DmaError`] keeps the errno a
//! host collaborator reported, so a failing acquisition step surfaces the
//! exact code the platform produced.

use core::fmt;

use linux_raw_sys::errno;
use strum::{EnumCount, FromRepr};

/// The kind of a [`DmaError`].
#[repr(i32)]
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, EnumCount, FromRepr)]
pub enum DmaErrorKind {
    /// The device number space has no free range left.
    NumbersExhausted = 1,
    /// The coherent memory region could not be allocated.
    NoMemory,
    /// The host refused to register a device, class or node.
    RegistrationRejected,
    /// The control code is not one this device understands.
    InvalidOperation,
    /// Copying a result into caller-provided storage failed.
    BadAddress,
    /// The host's coherent mapping primitive rejected the request.
    MappingRejected,
    /// The lifecycle operation is not valid in the current state.
    BadState,
}

impl DmaErrorKind {
    /// Returns the error description.
    pub fn as_str(&self) -> &'static str {
        use DmaErrorKind::*;
        match *self {
            NumbersExhausted => "Device number space exhausted",
            NoMemory => "Out of coherent memory",
            RegistrationRejected => "Registration rejected by host",
            InvalidOperation => "Invalid control operation",
            BadAddress => "Bad caller address",
            MappingRejected => "Mapping rejected by host",
            BadState => "Bad lifecycle state",
        }
    }

    /// Returns the error code value in `i32`.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// The Linux errno reported when no host-specific code is known.
    pub const fn default_errno(self) -> i32 {
        use DmaErrorKind::*;
        (match self {
            NumbersExhausted | BadState => errno::EBUSY,
            NoMemory => errno::ENOMEM,
            RegistrationRejected => errno::ENODEV,
            InvalidOperation => errno::EINVAL,
            BadAddress => errno::EFAULT,
            MappingRejected => errno::ENXIO,
        }) as i32
    }
}

impl TryFrom<i32> for DmaErrorKind {
    type Error = i32;

    #[inline]
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        DmaErrorKind::from_repr(value).ok_or(value)
    }
}

impl fmt::Display for DmaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The error type used by the DMA buffer device.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct DmaError {
    kind: DmaErrorKind,
    errno: i32,
}

impl DmaError {
    /// Creates an error carrying the default errno of `kind`.
    pub const fn new(kind: DmaErrorKind) -> Self {
        Self {
            kind,
            errno: kind.default_errno(),
        }
    }

    /// Creates an error carrying the errno a host collaborator reported.
    ///
    /// Non-positive values fall back to the default errno of `kind`.
    pub const fn with_errno(kind: DmaErrorKind, errno: i32) -> Self {
        if errno > 0 {
            Self { kind, errno }
        } else {
            Self::new(kind)
        }
    }

    /// Returns the kind of this error.
    pub const fn kind(self) -> DmaErrorKind {
        self.kind
    }

    /// Returns the positive Linux errno.
    pub const fn errno(self) -> i32 {
        self.errno
    }

    /// Returns the negative result code handed back to a caller.
    pub const fn as_ret(self) -> isize {
        -(self.errno as isize)
    }
}

impl From<DmaErrorKind> for DmaError {
    fn from(kind: DmaErrorKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Debug for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaErrorKind::{:?}(errno {})", self.kind, self.errno)
    }
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.kind, self.errno)
    }
}

macro_rules! dma_error_consts {
    ($($name:ident),*) => {
        #[allow(non_upper_case_globals)]
        impl DmaError {
            $(
                #[doc = concat!("A [`DmaError`] with kind [`DmaErrorKind::", stringify!($name), "`].")]
                pub const $name: Self = Self::new(DmaErrorKind::$name);
            )*
        }
    };
}

dma_error_consts!(
    NumbersExhausted,
    NoMemory,
    RegistrationRejected,
    InvalidOperation,
    BadAddress,
    MappingRejected,
    BadState
);

/// A specialized [`Result`] type with [`DmaError`] as the error type.
pub type DmaResult<T = ()> = Result<T, DmaError>;

/// Constructs a [`DmaError`] while printing a warning message.
///
/// # Examples
///
/// ```
/// # use dmabuf::{dma_err_type, DmaError};
/// assert_eq!(dma_err_type!(InvalidOperation), DmaError::InvalidOperation);
/// assert_eq!(
///     dma_err_type!(BadAddress, "destination not writable"),
///     DmaError::BadAddress,
/// );
/// ```
#[macro_export]
macro_rules! dma_err_type {
    ($err:ident) => {{
        use $crate::DmaErrorKind::*;
        let err = $crate::DmaError::from($err);
        $crate::__priv::warn!("[{:?}]", err);
        err
    }};
    ($err:ident, $msg:expr) => {{
        use $crate::DmaErrorKind::*;
        let err = $crate::DmaError::from($err);
        $crate::__priv::warn!("[{:?}] {}", err, $msg);
        err
    }};
}

/// Constructs an [`Err(DmaError)`] while printing a warning message.
///
/// # Examples
///
/// ```
/// # use dmabuf::{dma_err, DmaError, DmaResult};
/// assert_eq!(
///     dma_err!(InvalidOperation),
///     DmaResult::<()>::Err(DmaError::InvalidOperation),
/// );
/// ```
/// [`Err(DmaError)`]: Err
#[macro_export]
macro_rules! dma_err {
    ($err:ident) => {
        Err($crate::dma_err_type!($err))
    };
    ($err:ident, $msg:expr) => {
        Err($crate::dma_err_type!($err, $msg))
    };
}

/// Returns early with a [`DmaError`] of the given kind, optionally with a
/// message.
#[macro_export]
macro_rules! dma_bail {
    ($($t:tt)*) => {
        return $crate::dma_err!($($t)*);
    };
}

#[cfg(test)]
mod tests {
    use strum::EnumCount;

    use super::{DmaError, DmaErrorKind};
    use linux_raw_sys::errno;

    #[test]
    fn test_try_from() {
        let max_code = DmaErrorKind::COUNT as i32;
        assert_eq!(max_code, 7);
        assert_eq!(max_code, DmaError::BadState.kind().code());

        assert_eq!(Ok(DmaErrorKind::NumbersExhausted), DmaErrorKind::try_from(1));
        assert_eq!(Ok(DmaErrorKind::BadState), DmaErrorKind::try_from(max_code));
        assert_eq!(Err(0), DmaErrorKind::try_from(0));
        assert_eq!(Err(max_code + 1), DmaErrorKind::try_from(max_code + 1));
    }

    #[test]
    fn test_default_errno() {
        assert_eq!(DmaError::NoMemory.errno(), errno::ENOMEM as i32);
        assert_eq!(DmaError::InvalidOperation.errno(), errno::EINVAL as i32);
        assert_eq!(DmaError::BadAddress.errno(), errno::EFAULT as i32);
        assert_eq!(DmaError::NumbersExhausted.errno(), errno::EBUSY as i32);
        assert_eq!(DmaError::InvalidOperation.as_ret(), -(errno::EINVAL as isize));
    }

    #[test]
    fn test_host_errno_is_kept() {
        let err = DmaError::with_errno(DmaErrorKind::MappingRejected, errno::EPERM as i32);
        assert_eq!(err.kind(), DmaErrorKind::MappingRejected);
        assert_eq!(err.errno(), errno::EPERM as i32);
        assert_ne!(err, DmaError::MappingRejected);

        let fallback = DmaError::with_errno(DmaErrorKind::RegistrationRejected, -3);
        assert_eq!(fallback, DmaError::RegistrationRejected);
    }
}
