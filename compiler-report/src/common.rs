pub use anyhow::{bail, ensure, format_err, Context, Result};
pub use itertools::Itertools as _;
pub use once_cell::sync::Lazy;
pub use regex::Regex;
pub use serde::{Deserialize, Serialize};
pub use std::{
    fmt,
    fmt::Display,
    path::{Path, PathBuf},
};
