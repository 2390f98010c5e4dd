//! Priority run lists threaded through the thread arena.
//!
//! Each of the four lists is doubly linked through the threads' own
//! `queue_prev`/`queue_next` fields, so membership costs no allocation and
//! unlinking is O(1). New and re-queued threads join at the tail; the
//! scheduler scans tail-to-head.

use crate::arena::Arena;
use crate::thread::{Priority, Thread};

#[derive(Debug, Clone, Copy)]
struct RunList {
    head: Option<u32>,
    tail: Option<u32>,
}

impl RunList {
    const EMPTY: Self = Self {
        head: None,
        tail: None,
    };
}

/// One head/tail pair per priority class.
#[derive(Debug)]
pub(crate) struct RunQueues {
    lists: [RunList; 4],
}

impl RunQueues {
    pub(crate) const fn new() -> Self {
        Self {
            lists: [RunList::EMPTY; 4],
        }
    }

    /// Scan entry point: the most recently queued thread of the class.
    pub(crate) fn tail(&self, priority: Priority) -> Option<u32> {
        self.lists[priority.list_index()].tail
    }

    /// Appends the thread at the tail of its priority's list.
    ///
    /// The thread must not currently be linked anywhere.
    pub(crate) fn push(&mut self, threads: &mut Arena<Thread>, index: u32) {
        let priority = threads.at(index).priority;
        let list = &mut self.lists[priority.list_index()];

        let thread = threads.at_mut(index);
        debug_assert!(
            thread.queue_prev.is_none() && thread.queue_next.is_none(),
            "thread is already linked"
        );
        thread.queue_prev = list.tail;
        thread.queue_next = None;

        match list.tail {
            Some(tail) => threads.at_mut(tail).queue_next = Some(index),
            None => list.head = Some(index),
        }
        list.tail = Some(index);
    }

    /// Removes the thread from its priority's list.
    ///
    /// The thread must be linked; every live thread is.
    pub(crate) fn unlink(&mut self, threads: &mut Arena<Thread>, index: u32) {
        let (priority, prev, next) = {
            let thread = threads.at_mut(index);
            (
                thread.priority,
                thread.queue_prev.take(),
                thread.queue_next.take(),
            )
        };
        let list = &mut self.lists[priority.list_index()];
        match prev {
            Some(prev) => threads.at_mut(prev).queue_next = next,
            None => {
                debug_assert_eq!(list.head, Some(index), "thread was not linked");
                list.head = next;
            }
        }
        match next {
            Some(next) => threads.at_mut(next).queue_prev = prev,
            None => list.tail = prev,
        }
    }
}
