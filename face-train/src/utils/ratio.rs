use crate::common::*;

/// A finite value within the range `[0.0, 1.0]`.
///
/// Used for split fractions and the dropout rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Ratio(R64);

impl Ratio {
    pub fn zero() -> Self {
        Self(r64(0.0))
    }

    pub fn to_r64(&self) -> R64 {
        self.0
    }

    pub fn to_f64(&self) -> f64 {
        self.0.raw()
    }

    pub fn checked_add(&self, rhs: Ratio) -> Result<Self> {
        Self::try_from(self.0 + rhs.0)
    }

    /// Rounds `count * ratio` to the nearest integer.
    pub fn of_count(&self, count: usize) -> usize {
        (count as f64 * self.to_f64()).round() as usize
    }
}

impl Serialize for Ratio {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Self::try_from(value).map_err(|err| D::Error::custom(format!("{:?}", err)))
    }
}

impl AbsDiffEq<f64> for Ratio {
    type Epsilon = f64;

    fn default_epsilon() -> Self::Epsilon {
        f64::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &f64, epsilon: Self::Epsilon) -> bool {
        self.0.raw().abs_diff_eq(other, epsilon)
    }
}

impl TryFrom<R64> for Ratio {
    type Error = anyhow::Error;

    fn try_from(value: R64) -> Result<Self, Self::Error> {
        ensure!(
            ((0.0 - f64::default_epsilon())..=(1.0 + f64::default_epsilon()))
                .contains(&value.raw()),
            "ratio value must be within range [0.0, 1.0], but get {}",
            value
        );
        let value = value.max(R64::new(0.0)).min(R64::new(1.0));
        Ok(Self(value))
    }
}

impl TryFrom<f64> for Ratio {
    type Error = anyhow::Error;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::try_from(R64::try_new(value).ok_or_else(|| format_err!("not a finite value"))?)
    }
}

impl From<Ratio> for f64 {
    fn from(ratio: Ratio) -> Self {
        ratio.0.raw()
    }
}

impl PartialEq<f64> for Ratio {
    fn eq(&self, rhs: &f64) -> bool {
        self.0.raw().eq(rhs)
    }
}

impl Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.to_f64(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_range_test() -> Result<()> {
        assert!(Ratio::try_from(-0.1).is_err());
        assert!(Ratio::try_from(1.1).is_err());
        assert!(Ratio::try_from(f64::NAN).is_err());
        assert_eq!(Ratio::try_from(0.25)?, 0.25);
        assert!(Ratio::try_from(0.6)?
            .checked_add(Ratio::try_from(0.6)?)
            .is_err());
        Ok(())
    }

    #[test]
    fn ratio_of_count_test() -> Result<()> {
        let ratio = Ratio::try_from(0.2)?;
        assert_eq!(ratio.of_count(10), 2);
        assert_eq!(ratio.of_count(7), 1);
        assert_eq!(ratio.of_count(8), 2);
        assert_eq!(Ratio::zero().of_count(100), 0);
        Ok(())
    }

    #[test]
    fn ratio_deserialize_test() {
        let ratio: Ratio = serde_json::from_str("0.5").unwrap();
        assert_eq!(ratio, 0.5);
        assert!(serde_json::from_str::<Ratio>("1.5").is_err());
    }
}
