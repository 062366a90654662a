/// Run `f` on a path we expect to be rare (exhaustion, upstream refills...)
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
