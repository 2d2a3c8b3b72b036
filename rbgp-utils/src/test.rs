//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Compares two byte buffers, printing both in hexadecimal on mismatch.
#[macro_export]
macro_rules! assert_eq_hex {
    ($left:expr, $right:expr) => {
        if $left != $right {
            panic!(
                "assertion `left == right` failed\n  left: [{}]\n right: [{}]",
                $left
                    .iter()
                    .map(|b| format!("0x{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(", "),
                $right
                    .iter()
                    .map(|b| format!("0x{:02x}", b))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    };
}
