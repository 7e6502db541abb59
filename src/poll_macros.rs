//! Macros that insert safepoint polls into loops, calls and functions.
//!
//! Each macro polls the calling thread's current coordinator through
//! [`safepoint::poll`](crate::safepoint::poll) and propagates action errors
//! with `?`, so the enclosing function must return a `Result` whose error
//! converts from [`SafepointError`](crate::error::SafepointError).

/// Poll at every iteration of a loop.
///
/// # Examples
///
/// ```
/// use thread_safepoint::error::SafepointResult;
/// use thread_safepoint::location::Location;
/// use thread_safepoint::safepoint_loop;
///
/// fn sum(limit: u64) -> SafepointResult<u64> {
///     let mut total = 0;
///     safepoint_loop!(Location::new("sum:loop"), for i in 0..limit => {
///         total += i;
///     });
///     Ok(total)
/// }
///
/// assert_eq!(sum(100).unwrap(), 4950);
/// ```
#[macro_export]
macro_rules! safepoint_loop {
    ($location:expr, for $var:pat in $iter:expr => { $($body:tt)* }) => {{
        let __location: $crate::location::Location = $location;
        for $var in $iter {
            $crate::safepoint::poll(&__location)?;
            $($body)*
        }
    }};

    ($location:expr, while $cond:expr => { $($body:tt)* }) => {{
        let __location: $crate::location::Location = $location;
        while $cond {
            $crate::safepoint::poll(&__location)?;
            $($body)*
        }
    }};

    ($location:expr, loop { $($body:tt)* }) => {{
        let __location: $crate::location::Location = $location;
        loop {
            $crate::safepoint::poll(&__location)?;
            $($body)*
        }
    }};
}

/// Poll before and after a call that may run for a long time.
///
/// # Examples
///
/// ```
/// use thread_safepoint::error::SafepointResult;
/// use thread_safepoint::location::Location;
/// use thread_safepoint::safepoint_call;
///
/// fn run() -> SafepointResult<usize> {
///     Ok(safepoint_call!(Location::new("len"), "hello".len()))
/// }
///
/// assert_eq!(run().unwrap(), 5);
/// ```
#[macro_export]
macro_rules! safepoint_call {
    ($location:expr, $call:expr) => {{
        let __location: $crate::location::Location = $location;
        $crate::safepoint::poll(&__location)?;
        let __result = $call;
        $crate::safepoint::poll(&__location)?;
        __result
    }};
}

/// Define a function that polls on entry and on exit.
///
/// The function's return type is wrapped in
/// [`SafepointResult`](crate::error::SafepointResult).
///
/// # Examples
///
/// ```
/// use thread_safepoint::safepoint_function;
///
/// safepoint_function! {
///     fn checksum(data: &[u8]) -> usize {
///         data.iter().map(|&byte| byte as usize).sum()
///     }
/// }
///
/// assert_eq!(checksum(&[1, 2, 3]).unwrap(), 6);
/// ```
#[macro_export]
macro_rules! safepoint_function {
    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($($param:ident: $param_ty:ty),* $(,)?) -> $ret:ty {
            $($body:tt)*
        }
    ) => {
        $(#[$attr])*
        $vis fn $name($($param: $param_ty),*) -> $crate::error::SafepointResult<$ret> {
            let __location = $crate::location::Location::new(concat!(stringify!($name), ":entry"));
            $crate::safepoint::poll(&__location)?;
            let __result: $ret = { $($body)* };
            let __location = $crate::location::Location::new(concat!(stringify!($name), ":exit"));
            $crate::safepoint::poll(&__location)?;
            Ok(__result)
        }
    };

    (
        $(#[$attr:meta])*
        $vis:vis fn $name:ident($($param:ident: $param_ty:ty),* $(,)?) {
            $($body:tt)*
        }
    ) => {
        $crate::safepoint_function! {
            $(#[$attr])*
            $vis fn $name($($param: $param_ty),*) -> () {
                $($body)*
            }
        }
    };
}
