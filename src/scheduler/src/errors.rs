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

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Internal-error taxonomy (SPEC_FULL.md §7). Transport/parse/status
/// outcomes of a webhook attempt are not modeled as `Error` variants here —
/// they never propagate, they drive the retry state machine directly (see
/// `delivery::classify`).
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("SqlxError# {0}")]
    SqlxError(#[from] sqlx::Error),
    #[error("ConfigError# {0}")]
    ConfigError(#[from] config::Error),
    #[error("CronParseError# {0}")]
    CronParseError(String),
}
