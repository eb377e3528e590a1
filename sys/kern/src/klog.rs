// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel log.
//!
//! `klog!` formats a line into a fixed-depth ring of recent kernel events.
//! When the ring is full the oldest line is dropped. Nothing here allocates,
//! and a line that does not fit in `LINE_LEN` bytes is cut short.
//!
//! With the `klog-null` feature, logging compiles to nothing.

use core::fmt;

use crate::startup::config::KLOG_DEPTH;

/// Longest line kept in the ring.
pub const LINE_LEN: usize = 96;

/// Records a formatted line in the kernel log.
#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::klog::record(format_args!($($arg)*))
    };
}

cfg_if::cfg_if! {
    if #[cfg(feature = "klog-null")] {
        pub fn record(_args: fmt::Arguments<'_>) {}

        pub fn for_each_line(_f: impl FnMut(&str)) {}
    } else {
        use core::fmt::Write as _;

        use heapless::{Deque, String};
        use spin::Mutex;

        static RING: Mutex<Deque<String<LINE_LEN>, KLOG_DEPTH>> =
            Mutex::new(Deque::new());

        pub fn record(args: fmt::Arguments<'_>) {
            let mut line = String::new();
            let _ = line.write_fmt(args);

            let mut ring = RING.lock();
            if ring.is_full() {
                ring.pop_front();
            }
            let _ = ring.push_back(line);
        }

        /// Calls `f` on every line in the ring, oldest first.
        pub fn for_each_line(mut f: impl FnMut(&str)) {
            let ring = RING.lock();
            for line in ring.iter() {
                f(line);
            }
        }
    }
}

#[cfg(all(test, not(feature = "klog-null")))]
mod tests {
    use super::*;

    #[test]
    fn long_lines_are_cut_short() {
        let long = "x".repeat(LINE_LEN * 2);
        klog!("klog-test long {}", long);

        let mut lines = 0;
        let mut longest = 0;
        for_each_line(|l| {
            lines += 1;
            longest = longest.max(l.len());
        });
        assert!(lines > 0);
        assert!(lines <= KLOG_DEPTH);
        assert!(longest <= LINE_LEN);
    }
}
