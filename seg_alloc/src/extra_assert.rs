#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        assert!($condition $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert {
    ( $condition:expr $( , $args:expr )* ) => {
        if false {
            let _ = $condition;
            $( let _ = $args; )*
        }
    }
}

#[cfg(feature = "extra_assertions")]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        assert_eq!($left, $right $( , $args )* )
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_assert_eq {
    ( $left:expr , $right:expr $( , $args:expr )* ) => {
        if false {
            let _ = $left;
            let _ = $right;
            $( let _ = $args; )*
        }
    }
}

/// Run the full heap check on `$heap` and panic with the first violation.
///
/// Compiles to nothing unless the "extra_assertions" feature is enabled. The
/// check walks every block and every free list, so it turns each operation
/// into an *O(heap)* one.
#[cfg(feature = "extra_assertions")]
macro_rules! extra_check {
    ( $heap:expr , $op:expr ) => {
        if let Err(violation) = $heap.check() {
            panic!("heap inconsistent after {}: {}", $op, violation);
        }
    }
}

#[cfg(not(feature = "extra_assertions"))]
macro_rules! extra_check {
    ( $heap:expr , $op:expr ) => {
        if false {
            let _ = &$heap;
            let _ = $op;
        }
    }
}
