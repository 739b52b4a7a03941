//! Decoded exception events.

/// An `EXCEPTION_RECORD64` with the engine's 64-bit layout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExceptionRecord {
    pub exception_code: i32,
    pub exception_flags: u32,
    /// Address of a chained record in the target, 0 if none.
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub exception_information: [u64; 15],
}

impl ExceptionRecord {
    /// The parameters the record actually carries.
    pub fn parameters(&self) -> &[u64] {
        let n = (self.number_parameters as usize).min(self.exception_information.len());
        &self.exception_information[..n]
    }

    pub fn is_noncontinuable(&self) -> bool {
        self.exception_flags & 1 != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ExceptionInfo {
    pub record: ExceptionRecord,
    pub first_chance: bool,
}

#[cfg(windows)]
impl From<&windows::Win32::System::Diagnostics::Debug::EXCEPTION_RECORD64> for ExceptionRecord {
    fn from(r: &windows::Win32::System::Diagnostics::Debug::EXCEPTION_RECORD64) -> Self {
        Self {
            exception_code: r.ExceptionCode.0,
            exception_flags: r.ExceptionFlags,
            exception_record: r.ExceptionRecord,
            exception_address: r.ExceptionAddress,
            number_parameters: r.NumberParameters,
            exception_information: r.ExceptionInformation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_are_clamped_to_the_record() {
        let mut record = ExceptionRecord {
            exception_code: 0xc000_0005_u32 as i32,
            exception_flags: 0,
            exception_record: 0,
            exception_address: 0x7ff6_0000_1000,
            number_parameters: 2,
            exception_information: [0; 15],
        };
        record.exception_information[1] = 0xdead;
        assert_eq!(record.parameters(), &[0, 0xdead]);

        record.number_parameters = 99;
        assert_eq!(record.parameters().len(), 15);
        assert!(!record.is_noncontinuable());
    }
}
