use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::connection::ServerEndpoint;

/// LDAP result codes seen by the pass-through engine, including the
/// client-side codes used to report local failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    NoSuchObject,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    Other,
    ClientSideServerDown,
    ClientSideLocalError,
    ClientSideEncodingError,
    ClientSideDecodingError,
    ClientSideTimeout,
    ClientSideConnectError,
    ClientSideNoResultsReturned,
    ClientSideMoreResultsToReturn,
    /// Any code this engine has no name for.
    Unknown(u32),
}

impl ResultCode {
    pub fn from_rc(rc: u32) -> Self {
        match rc {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            32 => ResultCode::NoSuchObject,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            80 => ResultCode::Other,
            81 => ResultCode::ClientSideServerDown,
            82 => ResultCode::ClientSideLocalError,
            83 => ResultCode::ClientSideEncodingError,
            84 => ResultCode::ClientSideDecodingError,
            85 => ResultCode::ClientSideTimeout,
            91 => ResultCode::ClientSideConnectError,
            94 => ResultCode::ClientSideNoResultsReturned,
            95 => ResultCode::ClientSideMoreResultsToReturn,
            other => ResultCode::Unknown(other),
        }
    }

    pub fn rc(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::Other => 80,
            ResultCode::ClientSideServerDown => 81,
            ResultCode::ClientSideLocalError => 82,
            ResultCode::ClientSideEncodingError => 83,
            ResultCode::ClientSideDecodingError => 84,
            ResultCode::ClientSideTimeout => 85,
            ResultCode::ClientSideConnectError => 91,
            ResultCode::ClientSideNoResultsReturned => 94,
            ResultCode::ClientSideMoreResultsToReturn => 95,
            ResultCode::Unknown(rc) => *rc,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.rc())
    }
}

/// Internal failure of a pass-through step.
#[derive(Error, Debug, Clone)]
pub enum PtaError {
    /// Connect failure, timeout or disconnect: the server could not be used.
    #[error("connection to {endpoint} failed ({code}): {message}")]
    Connection {
        endpoint: ServerEndpoint,
        code: ResultCode,
        message: String,
    },

    /// The remote server rejected the presented credentials.
    #[error("invalid credentials for {identity}")]
    Credentials { identity: String },

    /// Any other non-success result returned by the remote server.
    #[error("{endpoint} returned {code}: {message}")]
    Protocol {
        endpoint: ServerEndpoint,
        code: ResultCode,
        message: String,
    },

    #[error("mapping failed: {0}")]
    Mapping(String),

    /// No server in any group could serve the request.
    #[error("no remote LDAP server available: {last}")]
    NoServerAvailable { last: Box<PtaError> },

    #[error("connection pool for {0} is closed")]
    PoolClosed(ServerEndpoint),

    #[error("password cache update failed: {0}")]
    Cache(String),
}

impl PtaError {
    pub fn connection(endpoint: &ServerEndpoint, code: ResultCode, message: impl Into<String>) -> Self {
        PtaError::Connection {
            endpoint: endpoint.clone(),
            code,
            message: message.into(),
        }
    }

    pub fn protocol(endpoint: &ServerEndpoint, code: ResultCode, message: impl Into<String>) -> Self {
        PtaError::Protocol {
            endpoint: endpoint.clone(),
            code,
            message: message.into(),
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match self {
            PtaError::Connection { code, .. } | PtaError::Protocol { code, .. } => *code,
            PtaError::Credentials { .. } | PtaError::Mapping(_) => ResultCode::InvalidCredentials,
            PtaError::NoServerAvailable { last } => last.result_code(),
            PtaError::PoolClosed(_) | PtaError::Cache(_) => ResultCode::ClientSideLocalError,
        }
    }
}

/// Decides which failures mean "this server is unusable".
///
/// Connection errors always qualify; protocol errors qualify when their
/// result code is on the allow-list.
#[derive(Debug, Clone)]
pub struct ServiceErrorClassifier {
    codes: HashSet<ResultCode>,
}

impl ServiceErrorClassifier {
    pub fn new(codes: impl IntoIterator<Item = ResultCode>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }

    pub fn default_codes() -> Vec<ResultCode> {
        vec![
            ResultCode::OperationsError,
            ResultCode::ProtocolError,
            ResultCode::AdminLimitExceeded,
            ResultCode::UnavailableCriticalExtension,
            ResultCode::Busy,
            ResultCode::Unavailable,
            ResultCode::UnwillingToPerform,
            ResultCode::LoopDetect,
            ResultCode::Other,
            ResultCode::ClientSideConnectError,
            ResultCode::ClientSideDecodingError,
            ResultCode::ClientSideEncodingError,
            ResultCode::ClientSideLocalError,
            ResultCode::ClientSideServerDown,
            ResultCode::ClientSideTimeout,
        ]
    }

    pub fn is_connection_failure(&self, err: &PtaError) -> bool {
        match err {
            PtaError::Connection { .. } | PtaError::NoServerAvailable { .. } => true,
            PtaError::Protocol { code, .. } => self.codes.contains(code),
            _ => false,
        }
    }
}

impl Default for ServiceErrorClassifier {
    fn default() -> Self {
        Self::new(Self::default_codes())
    }
}

/// The single error surfaced by `password_matches`. Server and mapping
/// detail stays in the log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pass-through authentication failed: {message}")]
pub struct DirectoryError {
    pub result_code: ResultCode,
    pub message: String,
}

impl DirectoryError {
    pub fn unavailable() -> Self {
        Self {
            result_code: ResultCode::InvalidCredentials,
            message: "remote authentication service unavailable".to_string(),
        }
    }
}
