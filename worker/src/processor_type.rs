use bytes::BytesMut;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    Default,
    Fallback,
}

impl ProcessorType {
    pub const ALL: [ProcessorType; 2] = [ProcessorType::Default, ProcessorType::Fallback];

    /// Name of the sorted set holding this processor's ledger entries.
    pub fn ledger_key(&self) -> &'static str {
        match self {
            ProcessorType::Default => "payments:default",
            ProcessorType::Fallback => "payments:fallback",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ProcessorType::Default => 0,
            ProcessorType::Fallback => 1,
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessorType::Default => write!(f, "default"),
            ProcessorType::Fallback => write!(f, "fallback"),
        }
    }
}

// Bound as the ledger set key, so rows group by processor identity.
impl ToSql for ProcessorType {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>>
    where
        Self: Sized,
    {
        self.ledger_key().to_sql(ty, out)
    }

    fn accepts(ty: &Type) -> bool
    where
        Self: Sized,
    {
        <&str as ToSql>::accepts(ty)
    }

    to_sql_checked!();
}
