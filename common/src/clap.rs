use std::{
    fmt::{self, Display},
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
};

//
// Secrets redaction
// It is nice to be able to debug print our CLI arguments on startup as this can save a lot of
// time when investigating a failed bootstrap. Some of our arguments are BMC and SSH passwords
// though, so we want a way of hiding those values from `Debug` calls.
//
// For this we have `CliSecret` and `RedactionFunction` which you can wrap around values which will modify
// debug print output.
//

pub trait RedactionFunction<T> {
    fn redact(s: &T) -> String;
}

pub const REDACTED_VALUE: &str = "<REDACTED>";

#[derive(Clone)]
pub struct PlainRedactor {}

impl<T> RedactionFunction<T> for PlainRedactor {
    fn redact(_: &T) -> String {
        REDACTED_VALUE.to_string()
    }
}

/// Shows an empty value as empty so that a missing password is still obvious in the logs,
/// anything else is redacted.
#[derive(Clone)]
pub struct EmptyVisibleRedactor {}

impl RedactionFunction<String> for EmptyVisibleRedactor {
    fn redact(s: &String) -> String {
        if s.is_empty() {
            "<EMPTY>".to_string()
        } else {
            REDACTED_VALUE.to_string()
        }
    }
}

#[derive(Clone)]
pub struct CliSecret<T, R>
where
    R: RedactionFunction<T>,
{
    value: T,
    redaction_function: PhantomData<R>,
}

impl<T, R> CliSecret<T, R>
where
    R: RedactionFunction<T>,
{
    pub fn new(value: T) -> Self {
        Self {
            value,
            redaction_function: PhantomData,
        }
    }
}

impl<T, R> Deref for CliSecret<T, R>
where
    R: RedactionFunction<T>,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T, R> fmt::Debug for CliSecret<T, R>
where
    T: Display,
    R: RedactionFunction<T>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = R::redact(&self.value);
        f.write_str(&text)
    }
}

impl<T, R> FromStr for CliSecret<T, R>
where
    T: FromStr,
    R: RedactionFunction<T>,
{
    type Err = T::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = T::from_str(s)?;
        Ok(CliSecret {
            value: t,
            redaction_function: PhantomData,
        })
    }
}

/// A password supplied on the command line, from the environment or from the inventory.
pub type Password = CliSecret<String, EmptyVisibleRedactor>;

#[cfg(test)]
mod tests {
    use crate::clap::{CliSecret, EmptyVisibleRedactor, Password};

    use super::PlainRedactor;

    #[test]
    fn plain_redactor() {
        let test_value = "secret value".to_string();

        let secret_wrapper = CliSecret::<String, PlainRedactor>::new(test_value);

        let debug_value = format!("{secret_wrapper:?}");

        assert_eq!(debug_value, "<REDACTED>");
    }

    #[test]
    fn empty_visible_redactor_hides_password() {
        let secret_wrapper = CliSecret::<String, EmptyVisibleRedactor>::new("hunter2".to_string());

        assert_eq!(format!("{secret_wrapper:?}"), "<REDACTED>");
        assert_eq!(secret_wrapper.as_str(), "hunter2");
    }

    #[test]
    fn empty_visible_redactor_shows_missing_password() {
        let secret_wrapper: Password = "".parse().unwrap();

        assert_eq!(format!("{secret_wrapper:?}"), "<EMPTY>");
    }
}
