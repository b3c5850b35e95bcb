use thiserror::Error;

/// Architectural exception vectors raised by the processor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    Nmi = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRange = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
}

impl Exception {
    pub const fn vector(self) -> u8 {
        self as u8
    }

    pub const fn from_vector(vector: u8) -> Option<Exception> {
        Some(match vector {
            0 => Exception::DivideError,
            1 => Exception::Debug,
            2 => Exception::Nmi,
            3 => Exception::Breakpoint,
            4 => Exception::Overflow,
            5 => Exception::BoundRange,
            6 => Exception::InvalidOpcode,
            7 => Exception::DeviceNotAvailable,
            8 => Exception::DoubleFault,
            9 => Exception::CoprocessorOverrun,
            10 => Exception::InvalidTss,
            11 => Exception::SegmentNotPresent,
            12 => Exception::StackFault,
            13 => Exception::GeneralProtection,
            14 => Exception::PageFault,
            _ => return None,
        })
    }

    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
        )
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Exception::DivideError => "#DE",
            Exception::Debug => "#DB",
            Exception::Nmi => "NMI",
            Exception::Breakpoint => "#BP",
            Exception::Overflow => "#OF",
            Exception::BoundRange => "#BR",
            Exception::InvalidOpcode => "#UD",
            Exception::DeviceNotAvailable => "#NM",
            Exception::DoubleFault => "#DF",
            Exception::CoprocessorOverrun => "#MF",
            Exception::InvalidTss => "#TS",
            Exception::SegmentNotPresent => "#NP",
            Exception::StackFault => "#SS",
            Exception::GeneralProtection => "#GP",
            Exception::PageFault => "#PF",
        }
    }
}

/// A fault signal: vector plus the optional error code pushed by delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("{} (vector {vector:#04x}, error code {error_code:?})", mnemonic(.vector))]
pub struct CpuException {
    pub vector: u8,
    pub error_code: Option<u16>,
}

fn mnemonic(vector: &u8) -> &'static str {
    Exception::from_vector(*vector).map_or("exception", Exception::mnemonic)
}

impl CpuException {
    pub const fn new(exception: Exception, error_code: Option<u16>) -> Self {
        Self {
            vector: exception.vector(),
            error_code,
        }
    }

    pub fn exception(&self) -> Option<Exception> {
        Exception::from_vector(self.vector)
    }
}

/// Outcome of anything that can fault while executing an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuFault {
    #[error(transparent)]
    Exception(#[from] CpuException),
    /// The processor stopped: triple fault, or a real-mode stack wrap the 286 cannot
    /// recover from.
    #[error("processor shutdown")]
    Shutdown,
}

impl CpuFault {
    pub const fn new(exception: Exception, error_code: Option<u16>) -> Self {
        CpuFault::Exception(CpuException::new(exception, error_code))
    }

    pub const fn de() -> Self {
        Self::new(Exception::DivideError, None)
    }

    pub const fn ud() -> Self {
        Self::new(Exception::InvalidOpcode, None)
    }

    pub const fn nm() -> Self {
        Self::new(Exception::DeviceNotAvailable, None)
    }

    pub const fn br() -> Self {
        Self::new(Exception::BoundRange, None)
    }

    pub const fn ts(code: u16) -> Self {
        Self::new(Exception::InvalidTss, Some(code))
    }

    pub const fn np(code: u16) -> Self {
        Self::new(Exception::SegmentNotPresent, Some(code))
    }

    pub const fn ss(code: u16) -> Self {
        Self::new(Exception::StackFault, Some(code))
    }

    pub const fn gp(code: u16) -> Self {
        Self::new(Exception::GeneralProtection, Some(code))
    }

    pub const fn pf(code: u16) -> Self {
        Self::new(Exception::PageFault, Some(code))
    }

    pub fn vector(&self) -> Option<u8> {
        match self {
            CpuFault::Exception(e) => Some(e.vector),
            CpuFault::Shutdown => None,
        }
    }
}

pub(crate) type Fallible<T = ()> = Result<T, CpuFault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    pub(crate) fn of(vector: u8) -> Self {
        match Exception::from_vector(vector) {
            Some(Exception::PageFault) => Self::PageFault,
            Some(Exception::DoubleFault) => Self::DoubleFault,
            Some(
                Exception::DivideError
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection,
            ) => Self::Contributory,
            _ => Self::Benign,
        }
    }
}

/// Whether `second`, raised while delivering `first`, escalates to a double fault.
pub(crate) fn should_double_fault(first: u8, second: u8) -> bool {
    use ExceptionClass as C;
    matches!(
        (C::of(first), C::of(second)),
        (C::Contributory, C::Contributory)
            | (C::PageFault, C::Contributory | C::PageFault)
    )
}
