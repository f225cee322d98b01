// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use burrow_logging::{AppenderGuard, LogBuilder};
use eyre::Result;

use crate::Opt;

pub(crate) fn init_logging(opt: &Opt) -> Result<Option<AppenderGuard>> {
    let default_targets = vec![
        // bin
        ("burrownode".to_string(), opt.log_level),
        // libs
        ("burrow_bootstrap".to_string(), opt.log_level),
        ("burrow_logging".to_string(), opt.log_level),
        ("burrow_node".to_string(), opt.log_level),
        ("burrow_protocol".to_string(), opt.log_level),
    ];

    let mut builder = LogBuilder::new(default_targets);
    builder.output_dest(opt.log_output_dest.clone());
    if let Some(format) = opt.log_format {
        builder.format(format);
    }
    Ok(builder.initialize()?)
}
