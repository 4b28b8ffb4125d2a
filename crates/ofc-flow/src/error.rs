//! Flow bookkeeping errors

use thiserror::Error;

use crate::entry::FlowState;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Flow table '{table}' is full (max {max} entries)")]
    Capacity { table: String, max: usize },

    #[error("Cookie {cookie:#x} cannot go {op} from state {state:?}")]
    Consistency {
        cookie: u64,
        state: FlowState,
        op: &'static str,
    },

    #[error("No flow entry with cookie {0:#x}")]
    UnknownCookie(u64),

    #[error("No flow table accepts this match/action combination")]
    NoFittingTable,

    #[error("Switch rejected flow with cookie {0:#x}")]
    InstallFailed(u64),

    #[error(transparent)]
    Controller(#[from] ofc_core::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

impl FlowError {
    /// Returns true if the error points at a bookkeeping bug rather than a runtime condition
    pub fn is_consistency(&self) -> bool {
        matches!(self, FlowError::Consistency { .. })
    }
}

impl From<FlowError> for ofc_core::Error {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Capacity { table, max } => ofc_core::Error::Capacity { table, max },
            FlowError::Consistency { cookie, state, op } => ofc_core::Error::Consistency {
                cookie,
                detail: format!("{} from {:?}", op, state),
            },
            FlowError::UnknownCookie(cookie) => {
                ofc_core::Error::not_found(format!("cookie {:#x}", cookie))
            }
            FlowError::Controller(inner) => inner,
            other => ofc_core::Error::invalid_argument(other.to_string()),
        }
    }
}
