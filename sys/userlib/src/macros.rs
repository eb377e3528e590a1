// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

cfg_if::cfg_if! {
    if #[cfg(feature = "log-null")] {
        #[macro_export]
        macro_rules! sys_log {
            ($rt:expr, $s:expr) => {
                { let _ = &$rt; }
            };
            ($rt:expr, $s:expr, $($x:expr),*$(,)?) => {
                {
                    let _ = &$rt;
                    $(
                        let _ = &$x;
                    )*
                }
            };
        }
    } else {
        /// Formats a line onto the console through `sys_cputs`.
        #[macro_export]
        macro_rules! sys_log {
            ($rt:expr, $s:expr) => {
                $crate::console::log_fmt($rt, format_args!($s))
            };
            ($rt:expr, $s:expr, $($tt:tt)*) => {
                $crate::console::log_fmt($rt, format_args!($s, $($tt)*))
            };
        }
    }
}
