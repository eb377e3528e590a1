// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console output from user code.
//!
//! `sys_cputs` reads its text out of user memory, so text is staged at the
//! bottom of the stack page before each call.

use core::fmt;

use crate::{sys_cputs, Runtime, PGSIZE, USTACKTOP};

/// Where text is staged for `sys_cputs`.
pub const STAGING_VA: u32 = USTACKTOP - PGSIZE;

/// Bytes staged per `sys_cputs` call.
pub const STAGING_LEN: usize = 128;

/// Prints `text` on the console.
pub fn puts<R: Runtime>(rt: &mut R, text: &[u8]) {
    for chunk in text.chunks(STAGING_LEN) {
        rt.store(STAGING_VA, chunk);
        let _ = sys_cputs(rt, STAGING_VA, chunk.len() as u32);
    }
}

struct LineWriter<'a, R> {
    rt: &'a mut R,
    buf: [u8; STAGING_LEN],
    len: usize,
}

impl<R: Runtime> LineWriter<'_, R> {
    fn flush(&mut self) {
        if self.len > 0 {
            puts(self.rt, &self.buf[..self.len]);
            self.len = 0;
        }
    }
}

impl<R: Runtime> fmt::Write for LineWriter<'_, R> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if self.len == self.buf.len() {
                self.flush();
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

/// Backend of `sys_log!`: formats `args` followed by a newline.
pub fn log_fmt<R: Runtime>(rt: &mut R, args: fmt::Arguments<'_>) {
    let mut w = LineWriter {
        rt,
        buf: [0; STAGING_LEN],
        len: 0,
    };
    let _ = fmt::Write::write_fmt(&mut w, args);
    let _ = fmt::Write::write_str(&mut w, "\n");
    w.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::Fake;
    use crate::Sysnum;

    #[test]
    fn long_text_goes_out_in_chunks() {
        let mut rt = Fake::default();
        puts(&mut rt, &[b'x'; 300]);
        let lens: Vec<u32> = rt.calls.iter().map(|(_, a)| a[1]).collect();
        assert_eq!(lens, vec![128, 128, 44]);
        assert!(rt
            .calls
            .iter()
            .all(|&(nr, a)| nr == Sysnum::Cputs && a[0] == STAGING_VA));
    }

    #[test]
    fn log_lines_end_in_newline() {
        let mut rt = Fake::default();
        log_fmt(&mut rt, format_args!("n = {}", 5));
        assert_eq!(rt.calls.len(), 1);
        let mut text = [0u8; 6];
        rt.load(STAGING_VA, &mut text);
        assert_eq!(&text, b"n = 5\n");
    }
}
