/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The canonical image reference grammar.
//!
//! User-supplied references are normalized before they touch the index:
//! a bare name completes to `docker.io/library/<name>:latest`, a named
//! reference without a tag gets `latest`, and digest references are
//! kept verbatim. Image ids (`sha256:<64 hex>`) bypass the grammar.

use thiserror::Error;

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library";
const DEFAULT_TAG: &str = "latest";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RefError {
    #[error("invalid image reference \"{0}\"")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RefError>;

/// Whether `raw` is an image id: the digest of an image config.
pub fn is_image_id(raw: &str) -> bool {
    match raw.strip_prefix("sha256:") {
        Some(hex) => {
            hex.len() == 64
                && hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

/// A parsed reference: domain, repository path, and either a tag or a
/// digest (a digest wins when both appear).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: String,
    pub path: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.contains(char::is_whitespace) {
            return Err(RefError::Invalid(raw.to_string()));
        }

        let (remainder, digest) = match raw.split_once('@') {
            Some((name, digest)) if is_image_id(digest) => {
                (name, Some(digest.to_string()))
            }
            Some(_) => return Err(RefError::Invalid(raw.to_string())),
            None => (raw, None),
        };

        // A ':' after the last '/' is a tag separator; before it, a
        // registry port.
        let (name, tag) = match remainder.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => {
                if !valid_tag(tag) {
                    return Err(RefError::Invalid(raw.to_string()));
                }
                (name, Some(tag.to_string()))
            }
            _ => (remainder, None),
        };

        let (domain, mut path) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.')
                    || first.contains(':')
                    || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
        };

        if domain == DEFAULT_DOMAIN && !path.contains('/') {
            path = format!("{OFFICIAL_REPO_PREFIX}/{path}");
        }

        if path.is_empty() || !valid_path(&path) {
            return Err(RefError::Invalid(raw.to_string()));
        }

        Ok(Self { domain, path, tag, digest })
    }

    /// The normalized form, with `latest` defaulted where appropriate.
    pub fn canonical(&self) -> String {
        let name = format!("{}/{}", self.domain, self.path);
        if let Some(digest) = &self.digest {
            return format!("{name}@{digest}");
        }
        let tag = self.tag.as_deref().unwrap_or(DEFAULT_TAG);
        format!("{name}:{tag}")
    }

    /// The registry host to resolve this reference against.
    pub fn host(&self) -> &str {
        &self.domain
    }
}

/// Normalizes a user-supplied reference.
pub fn normalize(raw: &str) -> Result<String> {
    Ok(ImageReference::parse(raw)?.canonical())
}

fn valid_path(path: &str) -> bool {
    path.split('/').all(|component| {
        !component.is_empty()
            && component.chars().all(|c| {
                c.is_ascii_lowercase()
                    || c.is_ascii_digit()
                    || matches!(c, '.' | '_' | '-')
            })
    })
}

fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bare_name_completes_fully() {
        assert_eq!(
            normalize("busybox").expect("normalize"),
            "docker.io/library/busybox:latest"
        );
    }

    #[test]
    fn test_name_with_tag_keeps_tag() {
        assert_eq!(
            normalize("registry.example.com/team/app:1.2").expect("normalize"),
            "registry.example.com/team/app:1.2"
        );
    }

    #[test]
    fn test_registry_with_port_is_a_domain() {
        assert_eq!(
            normalize("localhost:5000/app").expect("normalize"),
            "localhost:5000/app:latest"
        );
    }

    #[test]
    fn test_digest_reference_drops_tag() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        assert_eq!(
            normalize(&format!("busybox:1.36@{digest}")).expect("normalize"),
            format!("docker.io/library/busybox@{digest}")
        );
    }

    #[test]
    fn test_image_id_detection() {
        assert!(is_image_id(&format!("sha256:{}", "ab".repeat(32))));
        assert!(!is_image_id("sha256:abcd"));
        assert!(!is_image_id("busybox"));
        assert!(!is_image_id(&format!("sha512:{}", "ab".repeat(32))));
    }

    #[test]
    fn test_invalid_references_are_rejected() {
        for raw in ["", "UPPER/case", "name with space", "reg/ /x", "a@sha256:short"] {
            assert!(normalize(raw).is_err(), "{raw:?} should be invalid");
        }
    }

    #[test]
    fn test_host_extraction() {
        let parsed =
            ImageReference::parse("registry.example.com:443/team/app:1")
                .expect("parse");
        assert_eq!(parsed.host(), "registry.example.com:443");

        let parsed = ImageReference::parse("busybox").expect("parse");
        assert_eq!(parsed.host(), "docker.io");
    }
}
