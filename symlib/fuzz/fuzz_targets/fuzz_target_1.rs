#![no_main]

use libfuzzer_sys::fuzz_target;
use symlib::{reduce_crash, FnOracle, ReduceOptions};

/*
 * Drive the whole pipeline with a synthetic oracle: the first input
 * byte picks a needle, and a candidate "crashes" iff it still contains
 * that needle. Checks that reduction never grows the testcase and
 * never hands back a result the oracle rejects.
 */
fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    if data.len() > 64 {
        /* The quadratic passes make long inputs slow without covering
         * any new code paths. */
        return;
    }
    let (sel, testcase) = data.split_at(1);
    let needle = sel[0];
    let oracle = FnOracle(move |candidate: &[u8]| candidate.contains(&needle));
    let options = ReduceOptions {
        quiet: true,
        slow_middle: true,
        fix_non_alnum: true,
    };

    let held = testcase.contains(&needle);
    let result = reduce_crash(&oracle, testcase, options, None)
        .expect("predicate oracle cannot fail")
        .expect("sessions without a cache always produce a result");

    assert!(
        result.len() <= testcase.len(),
        "reduction grew the testcase: {:?} -> {:?}",
        testcase,
        result
    );
    /* Any accepted change went through the oracle, and replacement
     * bytes can introduce the needle even when the input lacked it. */
    if held || result != testcase {
        assert!(
            result.contains(&needle),
            "result no longer reproduces: {:?} -> {:?}",
            testcase,
            result
        );
    }
});
