//! TC3-HMAC-SHA256 request signing for the cloud API gateway.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::ControlPlaneError;

type HmacSha256 = Hmac<Sha256>;

pub(crate) const ALGORITHM: &str = "TC3-HMAC-SHA256";
pub(crate) const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host;x-tc-action";

/// Everything that goes into one signature.
pub(crate) struct SigningInput<'a> {
    pub secret_id: &'a str,
    pub secret_key: &'a str,
    pub service: &'a str,
    pub host: &'a str,
    pub action: &'a str,
    pub payload: &'a str,
    pub timestamp: DateTime<Utc>,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], msg: &str) -> Result<Vec<u8>, ControlPlaneError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| ControlPlaneError::Transport(format!("invalid signing key: {e}")))?;
    mac.update(msg.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn canonical_request(input: &SigningInput<'_>) -> String {
    let canonical_headers = format!(
        "content-type:{CONTENT_TYPE}\nhost:{}\nx-tc-action:{}\n",
        input.host,
        input.action.to_lowercase()
    );
    format!(
        "POST\n/\n\n{canonical_headers}\n{SIGNED_HEADERS}\n{}",
        sha256_hex(input.payload.as_bytes())
    )
}

/// Build the `Authorization` header value.
pub(crate) fn authorization(input: &SigningInput<'_>) -> Result<String, ControlPlaneError> {
    let date = input.timestamp.format("%Y-%m-%d").to_string();
    let scope = format!("{date}/{}/tc3_request", input.service);
    let string_to_sign = format!(
        "{ALGORITHM}\n{}\n{scope}\n{}",
        input.timestamp.timestamp(),
        sha256_hex(canonical_request(input).as_bytes())
    );

    let secret_date = hmac_sha256(format!("TC3{}", input.secret_key).as_bytes(), &date)?;
    let secret_service = hmac_sha256(&secret_date, input.service)?;
    let secret_signing = hmac_sha256(&secret_service, "tc3_request")?;
    let signature = hex::encode(hmac_sha256(&secret_signing, &string_to_sign)?);

    Ok(format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
        input.secret_id
    ))
}
