//! Masking and under frames: hiding enclosing handlers from operation
//! search.

use crate::common::*;
use multiprompt_effects::{Value, mask, perform, under};

#[test]
fn mask_hides_exactly_one_enclosing_handler() {
    let out = reader_handle(1, || {
        reader_handle(2, || {
            let masked = mask(READER, 0, || int(perform(READER_ASK, Value::null())));
            let unmasked = int(perform(READER_ASK, Value::null()));
            Value::from(masked * 10 + unmasked)
        })
    });
    // Masked performs skip the inner reader; unmasked ones do not.
    assert_eq!(int(out), 12);
}

#[test]
fn mask_from_skips_closer_handlers_only() {
    let out = reader_handle(1, || {
        reader_handle(2, || {
            reader_handle(3, || {
                // from = 1: the innermost handler still matches, the next
                // one out is hidden.
                let v = mask(READER, 1, || {
                    let inner = int(perform(READER_ASK, Value::null()));
                    let outer = mask(READER, 0, || int(perform(READER_ASK, Value::null())));
                    Value::from(inner * 10 + outer)
                });
                v
            })
        })
    });
    // inner = 3 (mask from=1 leaves the innermost), outer = skips 3, and
    // with the from=1 mask also 2, landing on 1.
    assert_eq!(int(out), 31);
}

#[test]
fn under_runs_the_body_outside_the_innermost_handler() {
    let out = reader_handle(10, || {
        reader_handle(20, || {
            let outside = under(READER, || int(perform(READER_ASK, Value::null())));
            let inside = int(perform(READER_ASK, Value::null()));
            Value::from(outside + inside)
        })
    });
    assert_eq!(int(out), 30);
}

#[test]
fn masking_is_scoped_to_its_body() {
    let out = reader_handle(5, || {
        let before = int(perform(READER_ASK, Value::null()));
        let masked_is_unhandled = mask(READER, 0, || {
            multiprompt_effects::try_perform(READER_ASK, Value::null()).is_none()
        });
        let after = int(perform(READER_ASK, Value::null()));
        Value::from(if masked_is_unhandled { before + after } else { -1 })
    });
    assert_eq!(int(out), 10);
}
