//! Per-call credentials.
//!
//! An [`Authorization`] renders as an `authorization: <scheme> <value>` header, where the value
//! is the base64 encoding of `username:secret`. Three schemes exist: `Basic` carries a plaintext
//! password, while the two MySQL schemes carry a password hash followed by its salt.

use std::{fmt, str::FromStr};

use base64::{Engine, engine::general_purpose::STANDARD};
use tonic::{
    metadata::{AsciiMetadataKey, AsciiMetadataValue},
    service::Interceptor,
};

use crate::error::{ConnectError, Result};

const SHA1_SIZE: usize = 20;
const SHA256_SIZE: usize = 32;

/// Authorization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthType {
    /// Username and plaintext password.
    Basic,
    /// Username, SHA-1 password hash, and salt.
    MysqlSha1,
    /// Username, SHA-256 password hash, and salt.
    MysqlSha256,
}

impl AuthType {
    /// The scheme as written in the header.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "Basic",
            Self::MysqlSha1 => "mysql-sha1",
            Self::MysqlSha256 => "mysql-sha256",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Basic" => Ok(Self::Basic),
            "mysql-sha1" => Ok(Self::MysqlSha1),
            "mysql-sha256" => Ok(Self::MysqlSha256),
            _ => Err(ConnectError::MalformedAuthorization),
        }
    }
}

/// Credentials attached to every call on a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct Authorization {
    auth_type: AuthType,
    username: String,
    header_value: String,
    secret: Option<Vec<u8>>,
}

impl Authorization {
    /// Creates `Basic` credentials.
    #[must_use]
    pub fn basic(username: &str, password: &str) -> Self {
        Self {
            auth_type: AuthType::Basic,
            username: username.to_string(),
            header_value: STANDARD.encode(format!("{username}:{password}")),
            secret: None,
        }
    }

    /// Creates MySQL credentials from a password hash and its salt. The hash length selects the
    /// scheme: 20 bytes is SHA-1, 32 bytes is SHA-256.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidMysqlAlgorithm`] for any other hash length.
    pub fn mysql(username: &str, salt: &[u8], password_hash: &[u8]) -> Result<Self> {
        let auth_type = match password_hash.len() {
            SHA1_SIZE => AuthType::MysqlSha1,
            SHA256_SIZE => AuthType::MysqlSha256,
            _ => return Err(ConnectError::InvalidMysqlAlgorithm),
        };

        let mut value = Vec::with_capacity(username.len() + 1 + password_hash.len() + salt.len());
        value.extend_from_slice(username.as_bytes());
        value.push(b':');
        value.extend_from_slice(password_hash);
        value.extend_from_slice(salt);

        Ok(Self {
            auth_type,
            username: username.to_string(),
            header_value: STANDARD.encode(value),
            secret: None,
        })
    }

    /// Parses an `authorization` header value, discarding the secret.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::MalformedAuthorization`] if the value is not
    /// `<scheme> <base64(username:secret)>` with a known scheme and a non-empty username.
    pub fn parse(value: &str) -> Result<Self> {
        Self::parse_inner(value, false)
    }

    /// Parses an `authorization` header value, keeping the decoded secret.
    ///
    /// # Errors
    ///
    /// As [`parse`](Self::parse); additionally an empty secret is malformed.
    pub fn parse_with_secret(value: &str) -> Result<Self> {
        Self::parse_inner(value, true)
    }

    fn parse_inner(value: &str, keep_secret: bool) -> Result<Self> {
        let (scheme, header_value) =
            value.split_once(' ').ok_or(ConnectError::MalformedAuthorization)?;
        let auth_type: AuthType = scheme.parse()?;

        let decoded =
            STANDARD.decode(header_value).map_err(|_| ConnectError::MalformedAuthorization)?;
        let colon = decoded.iter().position(|&b| b == b':');
        let (username, secret) = match colon {
            Some(pos) if pos >= 1 => (&decoded[..pos], &decoded[pos + 1..]),
            _ => return Err(ConnectError::MalformedAuthorization),
        };

        if keep_secret && secret.is_empty() {
            return Err(ConnectError::MalformedAuthorization);
        }

        // Any bytes are accepted as a username; invalid UTF-8 is replaced.
        let username = String::from_utf8_lossy(username).into_owned();

        Ok(Self {
            auth_type,
            username,
            header_value: header_value.to_string(),
            secret: keep_secret.then(|| secret.to_vec()),
        })
    }

    #[must_use]
    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The base64 part of the header.
    #[must_use]
    pub fn header_value(&self) -> &str {
        &self.header_value
    }

    /// The decoded secret, kept only by [`parse_with_secret`](Self::parse_with_secret).
    #[must_use]
    pub fn secret(&self) -> Option<&[u8]> {
        self.secret.as_deref()
    }

    /// Length of the password material: the secret length for `Basic`, the hash size otherwise.
    #[must_use]
    pub fn password_length(&self) -> usize {
        match self.auth_type {
            AuthType::Basic => self.secret.as_ref().map_or(0, Vec::len),
            AuthType::MysqlSha1 => SHA1_SIZE,
            AuthType::MysqlSha256 => SHA256_SIZE,
        }
    }

    /// The full header value, `<scheme> <value>`.
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.auth_type, self.header_value)
    }
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authorization")
            .field("auth_type", &self.auth_type)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Tonic interceptor that attaches credentials and extra headers to outgoing requests.
#[derive(Debug, Clone, Default)]
pub struct AuthInterceptor {
    authorization: Option<AsciiMetadataValue>,
    headers: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
}

impl AuthInterceptor {
    /// Creates an interceptor for the given credentials and headers.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Config`] if a header name or value is not valid ASCII metadata.
    pub fn new(authorization: Option<&Authorization>, headers: &[(String, String)]) -> Result<Self> {
        let authorization = authorization
            .map(|auth| metadata_value(&auth.authorization_header()))
            .transpose()?;
        let headers = headers
            .iter()
            .map(|(name, value)| {
                let key = AsciiMetadataKey::from_str(&name.to_ascii_lowercase()).map_err(|e| {
                    ConnectError::Config { message: format!("invalid header name '{name}': {e}") }
                })?;
                Ok((key, metadata_value(value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { authorization, headers })
    }

    /// Returns true if the interceptor adds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.authorization.is_none() && self.headers.is_empty()
    }
}

fn metadata_value(value: &str) -> Result<AsciiMetadataValue> {
    AsciiMetadataValue::from_str(value)
        .map_err(|e| ConnectError::Config { message: format!("invalid header value: {e}") })
}

impl Interceptor for AuthInterceptor {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        let metadata = request.metadata_mut();
        if let Some(auth) = &self.authorization {
            metadata.insert("authorization", auth.clone());
        }
        for (key, value) in &self.headers {
            metadata.insert(key.clone(), value.clone());
        }
        Ok(request)
    }
}
