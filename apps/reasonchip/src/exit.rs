//! Process exit codes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Exit {
    Ok = 0,
    GeneralError = 1,
    InvalidArgs = 2,
    ConfigError = 3,
    TransportError = 4,
    Cancelled = 5,
    RemoteError = 6,
}

impl From<Exit> for std::process::ExitCode {
    fn from(code: Exit) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Exit::Ok as u8, 0);
        assert_eq!(Exit::GeneralError as u8, 1);
        assert_eq!(Exit::InvalidArgs as u8, 2);
        assert_eq!(Exit::ConfigError as u8, 3);
        assert_eq!(Exit::TransportError as u8, 4);
        assert_eq!(Exit::Cancelled as u8, 5);
        assert_eq!(Exit::RemoteError as u8, 6);
    }
}
