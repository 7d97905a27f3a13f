use hvx_mmu::TranslateFault;
use thiserror::Error;

/// Architectural exceptions the emulator can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    #[error("#DE")]
    DivideError,
    #[error("#BP")]
    Breakpoint,
    #[error("#OF")]
    Overflow,
    #[error("#UD")]
    InvalidOpcode,
    #[error("#NM")]
    DeviceNotAvailable,
    #[error("#DF")]
    DoubleFault,
    #[error("#TS({0:#x})")]
    InvalidTss(u16),
    #[error("#NP({0:#x})")]
    SegmentNotPresent(u16),
    #[error("#SS({0:#x})")]
    StackFault(u32),
    #[error("#GP({0:#x})")]
    GeneralProtection(u32),
    #[error("#PF at {addr:#x} (error code {code:#x})")]
    PageFault { addr: u64, code: u32 },
}

impl Exception {
    pub const fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub const fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
        }
    }

    pub const fn error_code(&self) -> Option<u32> {
        match *self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(sel) | Exception::SegmentNotPresent(sel) => Some(sel as u32),
            Exception::StackFault(code) | Exception::GeneralProtection(code) => Some(code),
            Exception::PageFault { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Exception classes for the double-fault rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl FaultClass {
    pub const fn of_vector(vector: u8) -> Self {
        match vector {
            0 | 10 | 11 | 12 | 13 => FaultClass::Contributory,
            8 => FaultClass::DoubleFault,
            14 => FaultClass::PageFault,
            _ => FaultClass::Benign,
        }
    }
}

/// How a new exception combines with a hardware exception still in delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Deliver the new exception on its own.
    Serial,
    DoubleFault,
    TripleFault,
}

impl Escalation {
    pub const fn of(first: FaultClass, second: FaultClass) -> Self {
        use FaultClass::*;
        match (first, second) {
            (DoubleFault, Contributory | PageFault | DoubleFault) => Escalation::TripleFault,
            (Contributory, Contributory | DoubleFault) => Escalation::DoubleFault,
            (PageFault, Contributory | PageFault | DoubleFault) => Escalation::DoubleFault,
            _ => Escalation::Serial,
        }
    }
}

impl From<TranslateFault> for Exception {
    fn from(fault: TranslateFault) -> Self {
        match fault {
            TranslateFault::PageFault { addr, error_code } => Exception::PageFault {
                addr,
                code: error_code.bits(),
            },
            TranslateFault::NonCanonical(_) => Exception::gp0(),
        }
    }
}

/// Event type, numbered as in the VM-entry interruption-information field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
}

impl EventType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 7 {
            0 => EventType::ExternalInterrupt,
            2 => EventType::Nmi,
            3 => EventType::HardwareException,
            4 => EventType::SoftwareInterrupt,
            5 => EventType::PrivilegedSoftwareException,
            6 => EventType::SoftwareException,
            _ => return None,
        })
    }

    /// Software-originated events report the instruction length on entry.
    pub fn carries_instruction_length(self) -> bool {
        matches!(
            self,
            EventType::SoftwareInterrupt
                | EventType::PrivilegedSoftwareException
                | EventType::SoftwareException
        )
    }
}

/// The single event slot waiting for VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub kind: EventType,
    pub vector: u8,
    pub error_code: Option<u32>,
    pub instruction_len: u32,
}

impl PendingEvent {
    pub fn exception(exception: Exception) -> Self {
        let kind = match exception {
            // INT3 and INTO are delivered as software exceptions.
            Exception::Breakpoint | Exception::Overflow => EventType::SoftwareException,
            _ => EventType::HardwareException,
        };
        Self {
            kind,
            vector: exception.vector(),
            error_code: exception.error_code(),
            instruction_len: 0,
        }
    }

    pub fn external(vector: u8) -> Self {
        Self {
            kind: EventType::ExternalInterrupt,
            vector,
            error_code: None,
            instruction_len: 0,
        }
    }

    pub fn nmi() -> Self {
        Self {
            kind: EventType::Nmi,
            vector: 2,
            error_code: None,
            instruction_len: 0,
        }
    }

    pub fn software_interrupt(vector: u8, instruction_len: u32) -> Self {
        Self {
            kind: EventType::SoftwareInterrupt,
            vector,
            error_code: None,
            instruction_len,
        }
    }
}
