//! Proxy tasks: pre-built senders triggerable from interrupt context.
//!
//! A proxy is a tiny real-time task whose whole life is "wait for a
//! trigger, rpc a canned message to a fixed receiver". `trigger` just
//! bumps a counter and resumes the proxy, so an interrupt handler can
//! post a pre-formatted message without allocating anything.
use std::sync::Arc;

use crate::{
    error::{InitError, TaskError},
    exec::Executive,
    pipeline::Pipeline,
    task::{Priority, ProxyCtl, TaskId, TaskOptions},
};

impl<P: Pipeline> Executive<P> {
    /// Build a proxy aimed at `receiver`. The first machine word of
    /// `payload` (zero if shorter) is the rpc message; the full payload
    /// stays attached for extended consumers. The proxy runs at
    /// `priority` and starts dormant.
    pub fn proxy_attach(
        self: &Arc<Self>,
        receiver: TaskId,
        payload: &[u8],
        priority: Priority,
    ) -> Result<TaskId, InitError> {
        {
            let g = self.lock();
            if g.resolve(receiver).is_none() {
                return Err(InitError::BadParam);
            }
        }
        let id = self.task_init(priority, TaskOptions::default(), move |exec, me| {
            proxy_body(exec, me);
        })?;
        let mut g = self.lock();
        // The task was just created and cannot have vanished.
        let idx = g.resolve(id).expect("fresh proxy");
        g.tasks[idx as usize].proxy = Some(ProxyCtl {
            receiver,
            payload: payload.to_vec(),
            nmsgs: 0,
        });
        Ok(id)
    }

    /// Tear a proxy down. Returns the receiver it was aimed at.
    pub fn proxy_detach(&self, proxy: TaskId) -> Result<TaskId, TaskError> {
        let receiver = {
            let g = self.lock();
            let idx = g.resolve(proxy).ok_or(TaskError::BadTask)?;
            g.tasks[idx as usize]
                .proxy
                .as_ref()
                .ok_or(TaskError::NotPermitted)?
                .receiver
        };
        self.task_delete(proxy)?;
        Ok(receiver)
    }

    /// Fire the proxy: one more message will be rpc'd to its receiver.
    /// Usable from interrupt handlers.
    pub fn trigger(&self, proxy: TaskId) -> Result<TaskId, TaskError> {
        let receiver = {
            let mut g = self.lock();
            let idx = g.resolve(proxy).ok_or(TaskError::BadTask)?;
            let ctl = g.tasks[idx as usize]
                .proxy
                .as_mut()
                .ok_or(TaskError::NotPermitted)?;
            ctl.nmsgs += 1;
            ctl.receiver
        };
        self.task_resume(proxy)?;
        Ok(receiver)
    }
}

/// The proxy body: drain the trigger count, one rpc per trigger, then
/// sleep until the next trigger.
fn proxy_body<P: Pipeline>(exec: Arc<Executive<P>>, me: TaskId) {
    loop {
        loop {
            let (receiver, word) = {
                let mut g = exec.lock();
                let Some(idx) = g.resolve(me) else { return };
                let Some(ctl) = g.tasks[idx as usize].proxy.as_mut() else {
                    return;
                };
                if ctl.nmsgs == 0 {
                    break;
                }
                ctl.nmsgs -= 1;
                let mut word = [0u8; 8];
                let n = ctl.payload.len().min(8);
                word[..n].copy_from_slice(&ctl.payload[..n]);
                (ctl.receiver, usize::from_le_bytes(word))
            };
            if exec.rpc(receiver, word).is_err() {
                // Receiver gone; the proxy has nothing left to live for.
                return;
            }
        }
        if exec.task_suspend(me).is_err() {
            return;
        }
    }
}
