use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::macros::format_description;

use crate::models::{CoreError, CoreErrorKind};
use crate::vision::VisionResult;
use crate::vision::credentials::VisionCredentials;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HMAC-SHA256";
const SIGNED_HEADERS: &str = "content-type;host;x-content-sha256;x-date";

/// RFC 3986 unreserved characters stay literal; everything else is escaped.
pub(crate) const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone, Copy, Debug)]
pub struct SignableRequest<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query: &'a [(&'a str, &'a str)],
    pub content_type: &'a str,
    pub body: &'a [u8],
}

#[derive(Clone, Copy, Debug)]
pub struct SigningScope<'a> {
    pub region: &'a str,
    pub service: &'a str,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub x_date: String,
    pub x_content_sha256: String,
}

impl SignedHeaders {
    pub fn as_pairs(&self) -> [(&'static str, &str); 3] {
        [
            ("Authorization", self.authorization.as_str()),
            ("X-Date", self.x_date.as_str()),
            ("X-Content-Sha256", self.x_content_sha256.as_str()),
        ]
    }
}

pub fn sign_request(
    request: &SignableRequest<'_>,
    credentials: &VisionCredentials,
    scope: &SigningScope<'_>,
    now: OffsetDateTime,
) -> VisionResult<SignedHeaders> {
    let x_date = now
        .to_offset(time::UtcOffset::UTC)
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .map_err(|error| signing_error(format!("failed to format signing time: {error}")))?;
    let short_date = &x_date[..8];
    let payload_hash = hex_sha256(request.body);

    let canonical_request = [
        request.method.to_ascii_uppercase(),
        canonical_path(request.path),
        canonical_query(request.query),
        format!(
            "content-type:{}\nhost:{}\nx-content-sha256:{}\nx-date:{}\n",
            request.content_type.trim(),
            request.host.trim(),
            payload_hash,
            x_date
        ),
        SIGNED_HEADERS.to_string(),
        payload_hash.clone(),
    ]
    .join("\n");

    let credential_scope = format!(
        "{short_date}/{}/{}/request",
        scope.region, scope.service
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{x_date}\n{credential_scope}\n{}",
        hex_sha256(canonical_request.as_bytes())
    );

    let k_date = hmac_sha256(credentials.secret_key.as_bytes(), short_date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, scope.region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, scope.service.as_bytes())?;
    let k_signing = hmac_sha256(&k_service, b"request")?;
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        authorization: format!(
            "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            credentials.access_key
        ),
        x_date,
        x_content_sha256: payload_hash,
    })
}

/// Sorted by key then value, both percent-encoded.
pub fn canonical_query(query: &[(&str, &str)]) -> String {
    let mut encoded: Vec<(String, String)> = query
        .iter()
        .map(|(key, value)| {
            (
                utf8_percent_encode(key, URI_COMPONENT).to_string(),
                utf8_percent_encode(value, URI_COMPONENT).to_string(),
            )
        })
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn canonical_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

pub fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> VisionResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|error| signing_error(format!("invalid signing key: {error}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn signing_error(message: String) -> CoreError {
    CoreError::new(CoreErrorKind::Internal, message)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn request<'a>(query: &'a [(&'a str, &'a str)], body: &'a [u8]) -> SignableRequest<'a> {
        SignableRequest {
            method: "post",
            host: "visual.example.com",
            path: "/",
            query,
            content_type: "application/json",
            body,
        }
    }

    fn scope() -> SigningScope<'static> {
        SigningScope {
            region: "cn-north-1",
            service: "cv",
        }
    }

    #[test]
    fn empty_body_hashes_to_the_well_known_digest() {
        assert_eq!(
            hex_sha256(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn query_is_sorted_and_escaped() {
        assert_eq!(
            canonical_query(&[("Version", "2022-08-31"), ("Action", "CV Submit/Task")]),
            "Action=CV%20Submit%2FTask&Version=2022-08-31"
        );
        assert_eq!(canonical_query(&[]), "");
    }

    #[test]
    fn headers_carry_scope_date_and_payload_hash() {
        let credentials = VisionCredentials::new("AKTEST", "secret");
        let signed = sign_request(
            &request(&[("Action", "CVSubmitTask")], b""),
            &credentials,
            &scope(),
            datetime!(2024-01-02 03:04:05 UTC),
        )
        .unwrap();

        assert_eq!(signed.x_date, "20240102T030405Z");
        assert_eq!(signed.x_content_sha256, hex_sha256(b""));
        assert!(signed.authorization.starts_with(
            "HMAC-SHA256 Credential=AKTEST/20240102/cn-north-1/cv/request, \
             SignedHeaders=content-type;host;x-content-sha256;x-date, Signature="
        ));
        let signature = signed.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn signature_is_deterministic_and_covers_the_body() {
        let credentials = VisionCredentials::new("AKTEST", "secret");
        let at = datetime!(2024-01-02 03:04:05 UTC);
        let first = sign_request(&request(&[], b"{}"), &credentials, &scope(), at).unwrap();
        let again = sign_request(&request(&[], b"{}"), &credentials, &scope(), at).unwrap();
        let other_body =
            sign_request(&request(&[], b"{\"a\":1}"), &credentials, &scope(), at).unwrap();
        let other_secret = sign_request(
            &request(&[], b"{}"),
            &VisionCredentials::new("AKTEST", "different"),
            &scope(),
            at,
        )
        .unwrap();

        assert_eq!(first, again);
        assert_ne!(first.authorization, other_body.authorization);
        assert_ne!(first.authorization, other_secret.authorization);
    }
}
