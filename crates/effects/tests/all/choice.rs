//! N-queens through the choice handler: `choose` explores every column
//! placement, `fail` abandons a branch without running its drops. Frames
//! captured across `choose` hold only plain data, which is what makes the
//! multi-shot replay of the search tree sound.

use crate::common::*;
use multiprompt_effects::{Value, perform};

const MAX_N: usize = 12;

fn choose(n: i64) -> i64 {
    int(perform(CHOICE_CHOOSE, Value::from(n)))
}

fn fail() -> ! {
    perform(CHOICE_FAIL, Value::null());
    unreachable!("fail resumed");
}

fn safe(queen: i64, placed: &[i64]) -> bool {
    let mut diag = 1i64;
    for &q in placed.iter().rev() {
        if queen == q || queen == q + diag || queen == q - diag {
            return false;
        }
        diag += 1;
    }
    true
}

fn place(n: i64, col: usize) -> ([i64; MAX_N], usize) {
    if col == 0 {
        return ([0; MAX_N], 0);
    }
    let (mut sol, len) = place(n, col - 1);
    let queen = choose(n);
    if !safe(queen, &sol[..len]) {
        fail();
    }
    sol[len] = queen;
    (sol, len + 1)
}

fn nqueens(n: usize) -> i64 {
    choice_handle(move || {
        let _ = place(n as i64, n);
        Value::null()
    })
}

#[test]
fn eight_queens_has_ninety_two_solutions() {
    init_logging();
    assert_eq!(nqueens(8), 92);
}

#[test]
fn small_boards() {
    assert_eq!(nqueens(1), 1);
    assert_eq!(nqueens(2), 0);
    assert_eq!(nqueens(3), 0);
    assert_eq!(nqueens(4), 2);
    assert_eq!(nqueens(6), 4);
}

#[test]
fn pythagorean_triples() {
    // Three nested chooses, a fail for every non-triple; the handler
    // counts the completions.
    let count = choice_handle(|| {
        let x = choose(17);
        let y = choose(17);
        let z = choose(17);
        if !(x < y && x * x + y * y == z * z) {
            fail();
        }
        Value::null()
    });
    // (3,4,5) (6,8,10) (5,12,13) (9,12,15) (8,15,17)
    assert_eq!(count, 5);
}
