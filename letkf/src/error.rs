//! Error taxonomy shared by every component of the filter.
//!
//! Every variant carries enough context (`component`, and where relevant
//! `member`, `lat_idx`/`lon_idx`, `timestamp`) that a failing run can be
//! diagnosed from the error message alone, without re-reading logs.

use std::path::PathBuf;

/// Where in the pipeline an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Config,
    Grid,
    FieldStore,
    StateVector,
    Observation,
    Operator,
    Ensemble,
    Kernel,
    Driver,
    Shard,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Component::Config => "config",
            Component::Grid => "grid",
            Component::FieldStore => "field_store",
            Component::StateVector => "state_vector",
            Component::Observation => "observation",
            Component::Operator => "operator",
            Component::Ensemble => "ensemble",
            Component::Kernel => "kernel",
            Component::Driver => "driver",
            Component::Shard => "shard",
        };
        f.write_str(s)
    }
}

/// Context attached to most error variants: which column, which member, and
/// at what assimilation time the failure happened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorContext {
    pub member: Option<u32>,
    pub lat_idx: Option<usize>,
    pub lon_idx: Option<usize>,
    pub timestamp: Option<String>,
}

impl std::fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(m) = self.member {
            parts.push(format!("member={m}"));
        }
        if let (Some(la), Some(lo)) = (self.lat_idx, self.lon_idx) {
            parts.push(format!("lat_idx={la},lon_idx={lo}"));
        }
        if let Some(ts) = &self.timestamp {
            parts.push(format!("timestamp={ts}"));
        }
        write!(f, "[{}]", parts.join(", "))
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, member: u32) -> Self {
        self.member = Some(member);
        self
    }

    pub fn with_column(mut self, lat_idx: usize, lon_idx: usize) -> Self {
        self.lat_idx = Some(lat_idx);
        self.lon_idx = Some(lon_idx);
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }
}

/// Top-level error type produced by every `letkf` component.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config error in {component}: {message} {context}")]
    Config {
        component: Component,
        message: String,
        context: ErrorContext,
    },

    #[error("config declares NATURE_OPERATOR = \"NA\" (real observations); not implemented")]
    Unimplemented,

    #[error("input shape mismatch in {component}: {message} {context}")]
    InputShape {
        component: Component,
        message: String,
        context: ErrorContext,
    },

    #[error("observation error in {component}: {message} {context}")]
    Observation {
        component: Component,
        message: String,
        context: ErrorContext,
    },

    #[error("numeric error in {component}: {message} {context}")]
    Numeric {
        component: Component,
        message: String,
        context: ErrorContext,
    },

    #[error("missing shard for member={member}, lat_idx={lat_idx}, lon_idx={lon_idx}, timestamp={timestamp}")]
    MissingShard {
        member: u32,
        lat_idx: usize,
        lon_idx: usize,
        timestamp: String,
    },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("NetCDF error at {path}: {source}")]
    NetCdf {
        path: PathBuf,
        #[source]
        source: netcdf::Error,
    },

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn config(component: Component, message: impl Into<String>) -> Self {
        Error::Config {
            component,
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn input_shape(
        component: Component,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Error::InputShape {
            component,
            message: message.into(),
            context,
        }
    }

    pub fn observation(
        component: Component,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Error::Observation {
            component,
            message: message.into(),
            context,
        }
    }

    pub fn numeric(component: Component, message: impl Into<String>, context: ErrorContext) -> Self {
        Error::Numeric {
            component,
            message: message.into(),
            context,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn netcdf(path: impl Into<PathBuf>, source: netcdf::Error) -> Self {
        Error::NetCdf {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
