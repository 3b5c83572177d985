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

pub mod catalog;
pub mod env;
pub mod errors;
pub mod resolve;

pub use catalog::{CronTriggerDefinition, HeaderConf, RetryConf, TriggerCatalog, WebhookConf};
pub use env::{Config, CONFIG};
pub use errors::{Error, Result};
pub use resolve::{resolve_headers, resolve_webhook};
