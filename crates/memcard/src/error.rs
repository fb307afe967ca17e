use std::fmt;

/// Failure codes reported by every CARD operation.
///
/// The numeric values match the result codes stored in a channel's control
/// block, so callers that log or persist results can round-trip them through
/// [`CardError::code`] and [`CardError::from_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardError {
    Busy,
    WrongDevice,
    NoCard,
    NoFile,
    IoError,
    Broken,
    Exist,
    NoEnt,
    InsufficientSpace,
    NoPerm,
    Limit,
    NameTooLong,
    Encoding,
    Canceled,
    FatalError,
}

pub type CardResult<T> = Result<T, CardError>;

pub const RESULT_READY: i32 = 0;

impl CardError {
    pub const fn code(self) -> i32 {
        match self {
            CardError::Busy => -1,
            CardError::WrongDevice => -2,
            CardError::NoCard => -3,
            CardError::NoFile => -4,
            CardError::IoError => -5,
            CardError::Broken => -6,
            CardError::Exist => -7,
            CardError::NoEnt => -8,
            CardError::InsufficientSpace => -9,
            CardError::NoPerm => -10,
            CardError::Limit => -11,
            CardError::NameTooLong => -12,
            CardError::Encoding => -13,
            CardError::Canceled => -14,
            CardError::FatalError => -128,
        }
    }

    /// Maps a numeric code back to an error. Non-negative codes are successes
    /// and yield `None`, as do codes outside the known set.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -1 => CardError::Busy,
            -2 => CardError::WrongDevice,
            -3 => CardError::NoCard,
            -4 => CardError::NoFile,
            -5 => CardError::IoError,
            -6 => CardError::Broken,
            -7 => CardError::Exist,
            -8 => CardError::NoEnt,
            -9 => CardError::InsufficientSpace,
            -10 => CardError::NoPerm,
            -11 => CardError::Limit,
            -12 => CardError::NameTooLong,
            -13 => CardError::Encoding,
            -14 => CardError::Canceled,
            -128 => CardError::FatalError,
            _ => return None,
        };
        Some(err)
    }
}

/// Collapses a result into the numeric code a control block stores.
pub fn result_code(result: CardResult<()>) -> i32 {
    match result {
        Ok(()) => RESULT_READY,
        Err(err) => err.code(),
    }
}

impl fmt::Display for CardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CardError::Busy => write!(f, "Channel is busy"),
            CardError::WrongDevice => write!(f, "Device in slot is not a memory card"),
            CardError::NoCard => write!(f, "No memory card in slot"),
            CardError::NoFile => write!(f, "File not found"),
            CardError::IoError => write!(f, "Memory card I/O error"),
            CardError::Broken => write!(f, "Memory card file system is damaged"),
            CardError::Exist => write!(f, "File already exists"),
            CardError::NoEnt => write!(f, "Directory is full"),
            CardError::InsufficientSpace => write!(f, "Not enough free blocks"),
            CardError::NoPerm => write!(f, "File belongs to another application"),
            CardError::Limit => write!(f, "Access outside of file bounds"),
            CardError::NameTooLong => write!(f, "File name is longer than 32 bytes"),
            CardError::Encoding => write!(f, "Card was formatted with a different character encoding"),
            CardError::Canceled => write!(f, "Transfer canceled"),
            CardError::FatalError => write!(f, "Invalid argument"),
        }
    }
}

impl std::error::Error for CardError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_control_block_values() {
        assert_eq!(CardError::InsufficientSpace.code(), -9);
        assert_eq!(CardError::FatalError.code(), -128);
        assert_eq!(CardError::from_code(-13), Some(CardError::Encoding));
        assert_eq!(CardError::from_code(0), None);
        assert_eq!(CardError::from_code(-15), None);
        assert_eq!(result_code(Err(CardError::Busy)), -1);
        assert_eq!(result_code(Ok(())), RESULT_READY);
    }
}
