//! Macros for concise test setup.

/// Builds a message with the given creator, value and parents, adds it to `$state` and evaluates
/// to the `Result` of the addition. The first parent is the main parent; justifications are
/// derived from the cited messages, the way a live validator would cite its current view.
macro_rules! add_msg {
    ($state:ident, $creator:expr, $val:expr; $($parent:expr),+) => {{
        let swm = crate::consensus::dag::state::tests::wire_msg(
            &$state,
            $creator,
            $val,
            vec![$($parent),+],
            vec![],
            None,
            None,
        );
        $state.add_message(swm)
    }};
    ($state:ident, $creator:expr, $val:expr; $($parent:expr),+; cites $($cite:expr),*) => {{
        let swm = crate::consensus::dag::state::tests::wire_msg(
            &$state,
            $creator,
            $val,
            vec![$($parent),+],
            vec![$($cite),*],
            None,
            None,
        );
        $state.add_message(swm)
    }};
}
