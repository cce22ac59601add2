// Copyright (c) 2026 DCP-o-matic developers
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

mod cli;
mod frames;
mod runtime;

fn main() {
    let code = match runtime::run::<Vec<std::ffi::OsString>, std::ffi::OsString>(None) {
        Ok(()) => dcpcore::error::success(()),
        Err(err) => dcpcore::error::clap_or_error(err),
    };
    std::process::exit(code);
}
