// Copyright 2024 Zinc Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use crate::{
    catalog::{HeaderConf, WebhookConf},
    errors::{Error, Result},
};

/// Resolves a webhook reference against the process environment. A
/// `WebhookConf::Value` is used verbatim; a `WebhookConf::FromEnv` is looked
/// up and a missing variable is an `InternalError`-class failure (surfaced to
/// the caller, who is expected to leave the owning row `locked` for retry on
/// restart — see SPEC_FULL.md §4.5 Phase B).
pub fn resolve_webhook(conf: &WebhookConf) -> Result<String> {
    match conf {
        WebhookConf::Value(v) => Ok(v.clone()),
        WebhookConf::FromEnv(name) => std::env::var(name).map_err(|_| Error::EnvVarMissing(name.clone())),
    }
}

/// Resolves a list of header references, in order, skipping none: a failure
/// on any one header aborts resolution for the whole event.
pub fn resolve_headers(confs: &[HeaderConf]) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(confs.len());
    for conf in confs {
        let value = match (&conf.value, &conf.value_from_env) {
            (Some(v), _) => v.clone(),
            (None, Some(env_name)) => {
                std::env::var(env_name).map_err(|_| Error::EnvVarMissing(env_name.clone()))?
            }
            (None, None) => {
                return Err(Error::InvalidEnvVar(
                    conf.name.clone(),
                    "header has neither a literal value nor a value_from_env".to_string(),
                ))
            }
        };
        out.push((conf.name.clone(), value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_webhook() {
        let conf = WebhookConf::Value("https://example.com/hook".to_string());
        assert_eq!(resolve_webhook(&conf).unwrap(), "https://example.com/hook");
    }

    #[test]
    fn resolves_webhook_from_env() {
        std::env::set_var("SCHED_TEST_WEBHOOK_URL", "https://example.com/from-env");
        let conf = WebhookConf::FromEnv("SCHED_TEST_WEBHOOK_URL".to_string());
        assert_eq!(
            resolve_webhook(&conf).unwrap(),
            "https://example.com/from-env"
        );
        std::env::remove_var("SCHED_TEST_WEBHOOK_URL");
    }

    #[test]
    fn missing_env_var_is_an_error() {
        std::env::remove_var("SCHED_TEST_MISSING_VAR");
        let conf = WebhookConf::FromEnv("SCHED_TEST_MISSING_VAR".to_string());
        assert!(resolve_webhook(&conf).is_err());
    }

    #[test]
    fn resolves_mixed_headers() {
        std::env::set_var("SCHED_TEST_HEADER_VALUE", "secret-token");
        let confs = vec![
            HeaderConf {
                name: "X-Static".to_string(),
                value: Some("static-value".to_string()),
                value_from_env: None,
            },
            HeaderConf {
                name: "Authorization".to_string(),
                value: None,
                value_from_env: Some("SCHED_TEST_HEADER_VALUE".to_string()),
            },
        ];
        let resolved = resolve_headers(&confs).unwrap();
        assert_eq!(
            resolved,
            vec![
                ("X-Static".to_string(), "static-value".to_string()),
                ("Authorization".to_string(), "secret-token".to_string()),
            ]
        );
        std::env::remove_var("SCHED_TEST_HEADER_VALUE");
    }

    #[test]
    fn header_with_neither_value_nor_env_is_an_error() {
        let confs = vec![HeaderConf {
            name: "X-Broken".to_string(),
            value: None,
            value_from_env: None,
        }];
        assert!(resolve_headers(&confs).is_err());
    }
}
