// Copyright (c) 2018 The supervisord maintainers and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP Basic authentication for the control endpoints. Passwords prefixed
//! `{SHA}` are compared as `hex(sha1(provided))` against the suffix;
//! anything else is a literal compare. With no credentials configured the
//! middleware waves everything through.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::{web, HttpResponse};
use base64::Engine;
use sha1::{Digest, Sha1};

use super::AppCtx;

const SHA_PREFIX: &str = "{SHA}";

pub async fn require_basic_auth(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> actix_web::Result<ServiceResponse<impl MessageBody>> {
    let authorized = match req.app_data::<web::Data<AppCtx>>() {
        Some(ctx) => {
            ctx.username.is_empty()
                || ctx.password.is_empty()
                || provided_credentials(&req)
                    .map(|(user, pass)| {
                        user == ctx.username && check_password(&ctx.password, &pass)
                    })
                    .unwrap_or(false)
        }
        None => true,
    };
    if authorized {
        Ok(next.call(req).await?.map_into_left_body())
    } else {
        let response = HttpResponse::Unauthorized()
            .insert_header(("WWW-Authenticate", "Basic realm=\"supervisor\""))
            .finish();
        Ok(req.into_response(response).map_into_right_body())
    }
}

fn provided_credentials(req: &ServiceRequest) -> Option<(String, String)> {
    let header = req.headers().get("Authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Compare a provided password against the configured one, honoring the
/// `{SHA}` scheme.
pub fn check_password(configured: &str, provided: &str) -> bool {
    match configured.strip_prefix(SHA_PREFIX) {
        Some(digest) => {
            let mut hasher = Sha1::new();
            hasher.update(provided.as_bytes());
            hex::encode(hasher.finalize()).eq_ignore_ascii_case(digest)
        }
        None => configured == provided,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_passwords_compare_literally() {
        assert!(check_password("secret", "secret"));
        assert!(!check_password("secret", "wrong"));
    }

    #[test]
    fn sha_passwords_compare_hashed() {
        // hex(sha1("secret"))
        let configured = "{SHA}e5e9fa1ba31ecd1ae84f75caaa474f3a663f05f4";
        assert!(check_password(configured, "secret"));
        assert!(!check_password(configured, "Secret"));
        assert!(!check_password(configured, ""));
    }

    #[test]
    fn sha_digest_case_is_ignored() {
        let configured = "{SHA}E5E9FA1BA31ECD1AE84F75CAAA474F3A663F05F4";
        assert!(check_password(configured, "secret"));
    }
}
