//! Common imports from external crates.

pub use crate::error::{Error, ExportStage, Fallible};
pub use anyhow::{bail, ensure, format_err, Context, Result};
pub use approx::AbsDiffEq;
pub use chrono::{DateTime, Local};
pub use futures::future::FutureExt;
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use ndarray::Array2;
pub use noisy_float::prelude::*;
pub use once_cell::sync::Lazy;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use regex::Regex;
pub use semver::{Version, VersionReq};
pub use serde::{de::Error as DeserializeError, Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    borrow::{Borrow, Cow},
    collections::{HashMap, HashSet},
    convert::{TryFrom, TryInto},
    fmt,
    fmt::{Debug, Display},
    fs,
    io::{self, BufWriter},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use strum::{AsRefStr, Display as StrumDisplay, EnumString};
pub use tch::{nn, nn::ModuleT, nn::OptimizerConfig as _, Device, Kind, Tensor};
pub use tokio::sync::broadcast;
pub use tracing::{debug, error, info, info_span, instrument, trace, warn, Instrument};
