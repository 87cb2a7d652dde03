//! Error taxonomy of the executive.
//!
//! Every public operation returns a dedicated error enum listing only the
//! failures that operation can actually produce. All variants are drawn
//! from one closed set of result codes so that skins can map them onto a
//! foreign error namespace with a single table.
use core::fmt;

/// The closed set of failure codes used by the executive.
///
/// Kinds, not specific integers: skins assign their own numeric values.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ResultCode {
    /// An argument was out of range or malformed (bad priority, bad
    /// period, zero quantum, ...).
    BadParam,
    /// A task reference did not name a live task (magic mismatch).
    BadTask,
    /// An object reference did not name a live object.
    BadObject,
    /// The slot is already occupied (IRQ vector, registry index, watchdog,
    /// reserved priority).
    Busy,
    /// No free control block, context, or pool entry.
    Exhausted,
    /// The operation needs a context the caller is not in (blocking from
    /// an interrupt handler, hard-only operation from soft mode, ...).
    NotPermitted,
    /// A blocking call woke because its deadline passed.
    Timeout,
    /// A blocking call woke because the partner task was destroyed.
    Unblocked,
    /// A blocking call woke because the object it waited on was deleted.
    Closed,
    /// The operation would have blocked and the caller asked not to.
    WouldBlock,
}

macro_rules! define_suberror_common {
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant, )*
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }
    };
}

macro_rules! define_suberror {
    (
        $( #[doc $( $doc:tt )*] )*
        #[into( $Supererror:path )]
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        define_suberror_common! {
            $( #[doc $( $doc )*] )*
            $vis enum $Name {
                $( $Variant, )*
            }
        }

        impl From<$Name> for $Supererror {
            #[inline]
            fn from(x: $Name) -> Self {
                match ResultCode::from(x) {
                    $( ResultCode::$Variant => Self::$Variant, )*
                    // A suberror only carries its own variants.
                    _ => unreachable!(),
                }
            }
        }
    };
    (
        $( #[doc $( $doc:tt )*] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        define_suberror_common! {
            $( #[doc $( $doc )*] )*
            $vis enum $Name {
                $( $Variant, )*
            }
        }
    };
}

define_suberror! {
    /// Errors from task creation.
    pub enum InitError {
        BadParam,
        Busy,
        Exhausted,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from operations that target a task by reference.
    pub enum TaskError {
        BadTask,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from `sleep`, `sleep_until` and `wait_period`.
    pub enum SleepError {
        BadParam,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from creating a blocking object.
    pub enum CreateError {
        BadParam,
        Exhausted,
    }
}

define_suberror! {
    /// Errors from non-wait operations on a blocking object
    /// (signal, broadcast, delete).
    pub enum ObjectError {
        BadObject,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from a blocking wait on a semaphore, mutex or condition
    /// variable.
    #[into(WaitTimeoutError)]
    pub enum WaitError {
        BadObject,
        Unblocked,
        Closed,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from a timed wait on a blocking object.
    pub enum WaitTimeoutError {
        BadObject,
        Unblocked,
        Closed,
        NotPermitted,
        Timeout,
    }
}

define_suberror! {
    /// Errors from a non-blocking try-wait.
    pub enum TryWaitError {
        BadObject,
        WouldBlock,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from blocking messaging operations. `Unblocked` stands in
    /// for the source's "NULL partner" sentinel.
    #[into(MsgTimeoutError)]
    pub enum MsgError {
        BadTask,
        Unblocked,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from timed messaging operations.
    pub enum MsgTimeoutError {
        BadTask,
        Unblocked,
        NotPermitted,
        Timeout,
    }
}

define_suberror! {
    /// Errors from the `_if` messaging variants.
    pub enum TryMsgError {
        BadTask,
        WouldBlock,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from IRQ-table manipulation.
    pub enum IrqError {
        BadParam,
        Busy,
    }
}

define_suberror! {
    /// Errors from the feature registry.
    pub enum RegistryError {
        BadParam,
        Busy,
    }
}

define_suberror! {
    /// Errors from hard/soft migration requests.
    pub enum MigrateError {
        BadTask,
        Busy,
        NotPermitted,
    }
}

define_suberror! {
    /// Errors from timer bring-up and teardown.
    pub enum TimerError {
        BadParam,
        Busy,
        NotPermitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suberror_widens() {
        let e: WaitTimeoutError = WaitError::Unblocked.into();
        assert_eq!(e, WaitTimeoutError::Unblocked);
        let e: MsgTimeoutError = MsgError::BadTask.into();
        assert_eq!(e, MsgTimeoutError::BadTask);
    }

    #[test]
    fn debug_matches_result_code() {
        assert_eq!(format!("{:?}", TryWaitError::WouldBlock), "WouldBlock");
        assert_eq!(format!("{:?}", InitError::Exhausted), "Exhausted");
    }
}
