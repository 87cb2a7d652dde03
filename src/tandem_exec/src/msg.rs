//! Synchronous intertask messaging: send / receive / rpc / return.
//!
//! The model is a rendezvous over machine-word messages. A sender finding
//! its receiver already waiting delivers directly and continues; anyone
//! else parks on the partner's queues. `rpc` additionally waits for a
//! reply delivered by `msg_return`, inheriting the caller's priority into
//! the server while the call is outstanding.
//!
//! Extended variants (`sendx` and friends) carry variable-length
//! payloads through the per-task message control block. The control
//! block belongs to the single outstanding blocking call of its task;
//! re-entrant use is refused.
//!
//! Every operation returns the partner task on success; the source's
//! "NULL partner" sentinel (partner destroyed, nothing transferred)
//! surfaces as an `Unblocked` error, and an invalid handle as `BadTask`.
use crate::{
    error::{MsgError, MsgTimeoutError, TryMsgError},
    exec::Executive,
    pipeline::Pipeline,
    sched::{Plan, SchedState},
    task::{wait_enq, wait_rem, timed_rem, Blocker, Carrier, TaskId, TaskState, WaitRes, RPC_UNIT},
    time::Count,
};

/// What a blocking messaging call should do about time.
#[derive(Clone, Copy)]
enum Wait {
    Forever,
    Until(Count),
    NoWait,
}

impl<P: Pipeline> Executive<P> {
    // -----------------------------------------------------------------
    // Scalar send

    /// Send `msg` to `dst`, blocking until a rendezvous happens.
    pub fn send(&self, dst: TaskId, msg: usize) -> Result<TaskId, MsgError> {
        self.send_core(dst, Carrier::Word(msg), Wait::Forever)
            .map_err(strip_timeout)
    }

    /// Send only if `dst` is already waiting to receive.
    pub fn send_if(&self, dst: TaskId, msg: usize) -> Result<TaskId, TryMsgError> {
        self.send_core(dst, Carrier::Word(msg), Wait::NoWait)
            .map_err(timeout_to_wouldblock)
    }

    /// Send, giving up at the absolute instant `time`.
    pub fn send_until(&self, dst: TaskId, msg: usize, time: Count) -> Result<TaskId, MsgTimeoutError> {
        self.send_core(dst, Carrier::Word(msg), Wait::Until(time))
    }

    /// Send, giving up after `delay` counts.
    pub fn send_timed(&self, dst: TaskId, msg: usize, delay: Count) -> Result<TaskId, MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.send_core(dst, Carrier::Word(msg), Wait::Until(t))
    }

    // -----------------------------------------------------------------
    // Scalar rpc / return

    /// Send `msg` to `dst` and wait for the reply delivered by the
    /// matching [`msg_return`](Self::msg_return).
    pub fn rpc(&self, dst: TaskId, msg: usize) -> Result<(TaskId, usize), MsgError> {
        self.rpc_core(dst, Carrier::Word(msg), Wait::Forever)
            .map(|(t, c)| (t, word_of(c)))
            .map_err(strip_timeout)
    }

    /// RPC only if `dst` is already waiting to receive; still blocks for
    /// the reply.
    pub fn rpc_if(&self, dst: TaskId, msg: usize) -> Result<(TaskId, usize), TryMsgError> {
        self.rpc_core(dst, Carrier::Word(msg), Wait::NoWait)
            .map(|(t, c)| (t, word_of(c)))
            .map_err(timeout_to_wouldblock)
    }

    pub fn rpc_until(
        &self,
        dst: TaskId,
        msg: usize,
        time: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        self.rpc_core(dst, Carrier::Word(msg), Wait::Until(time))
            .map(|(t, c)| (t, word_of(c)))
    }

    pub fn rpc_timed(
        &self,
        dst: TaskId,
        msg: usize,
        delay: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.rpc_core(dst, Carrier::Word(msg), Wait::Until(t))
            .map(|(t, c)| (t, word_of(c)))
    }

    /// Whether `task` is blocked awaiting an RPC reply; such a task must
    /// be answered with [`msg_return`](Self::msg_return), not woken by
    /// other means.
    pub fn isrpc(&self, task: TaskId) -> bool {
        let g = self.lock();
        g.tcb(task)
            .map_or(false, |t| t.state.contains(TaskState::RETURN))
    }

    /// Deliver `reply` to an RPC caller previously accepted with a
    /// receive. If the caller gave up (killed or timed out) the reply is
    /// discarded and `Unblocked` is returned.
    pub fn msg_return(&self, caller: TaskId, reply: usize) -> Result<TaskId, MsgError> {
        self.return_core(caller, Carrier::Word(reply), &[])
    }

    // -----------------------------------------------------------------
    // Scalar receive

    /// Receive from `src`, or from anyone when `None`. Returns the
    /// sender and the message word.
    pub fn receive(&self, src: Option<TaskId>) -> Result<(TaskId, usize), MsgError> {
        self.receive_core(src, Wait::Forever, None)
            .map(|(t, c, _)| (t, word_of(c)))
            .map_err(strip_timeout)
    }

    pub fn receive_if(&self, src: Option<TaskId>) -> Result<(TaskId, usize), TryMsgError> {
        self.receive_core(src, Wait::NoWait, None)
            .map(|(t, c, _)| (t, word_of(c)))
            .map_err(timeout_to_wouldblock)
    }

    pub fn receive_until(
        &self,
        src: Option<TaskId>,
        time: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        self.receive_core(src, Wait::Until(time), None)
            .map(|(t, c, _)| (t, word_of(c)))
    }

    pub fn receive_timed(
        &self,
        src: Option<TaskId>,
        delay: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.receive_core(src, Wait::Until(t), None)
            .map(|(t, c, _)| (t, word_of(c)))
    }

    /// Peek at the pending message from `src` (or from the head of the
    /// inbound queue) without consuming it or waking anyone.
    pub fn evdrp(&self, src: Option<TaskId>) -> Result<(TaskId, usize), TryMsgError> {
        let g = self.lock();
        let me = self.current_task_idx(&g).ok_or(TryMsgError::NotPermitted)?;
        let s = self
            .find_sender(&g, me, src)?
            .ok_or(TryMsgError::WouldBlock)?;
        let t = &g.tasks[s as usize];
        Ok((t.id(s), word_of(t.msg)))
    }

    // -----------------------------------------------------------------
    // Extended messages

    /// Send a byte payload through the message control block.
    pub fn sendx(&self, dst: TaskId, payload: &[u8]) -> Result<TaskId, MsgError> {
        self.sendx_core(dst, payload, Wait::Forever).map_err(strip_timeout)
    }

    pub fn sendx_if(&self, dst: TaskId, payload: &[u8]) -> Result<TaskId, TryMsgError> {
        self.sendx_core(dst, payload, Wait::NoWait)
            .map_err(timeout_to_wouldblock)
    }

    pub fn sendx_until(
        &self,
        dst: TaskId,
        payload: &[u8],
        time: Count,
    ) -> Result<TaskId, MsgTimeoutError> {
        self.sendx_core(dst, payload, Wait::Until(time))
    }

    pub fn sendx_timed(
        &self,
        dst: TaskId,
        payload: &[u8],
        delay: Count,
    ) -> Result<TaskId, MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.sendx_core(dst, payload, Wait::Until(t))
    }

    fn sendx_core(
        &self,
        dst: TaskId,
        payload: &[u8],
        wait: Wait,
    ) -> Result<TaskId, MsgTimeoutError> {
        let me = self.mcb_acquire(payload, 0)?;
        let res = self.send_core(dst, Carrier::Block, wait);
        self.mcb_release(me);
        res
    }

    /// Extended RPC: ship `payload`, receive up to `reply_buf.len()`
    /// reply bytes. Returns the server and the delivered length.
    pub fn rpcx(
        &self,
        dst: TaskId,
        payload: &[u8],
        reply_buf: &mut [u8],
    ) -> Result<(TaskId, usize), MsgError> {
        self.rpcx_core(dst, payload, reply_buf, Wait::Forever)
            .map_err(strip_timeout)
    }

    pub fn rpcx_if(
        &self,
        dst: TaskId,
        payload: &[u8],
        reply_buf: &mut [u8],
    ) -> Result<(TaskId, usize), TryMsgError> {
        self.rpcx_core(dst, payload, reply_buf, Wait::NoWait)
            .map_err(timeout_to_wouldblock)
    }

    pub fn rpcx_until(
        &self,
        dst: TaskId,
        payload: &[u8],
        reply_buf: &mut [u8],
        time: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        self.rpcx_core(dst, payload, reply_buf, Wait::Until(time))
    }

    pub fn rpcx_timed(
        &self,
        dst: TaskId,
        payload: &[u8],
        reply_buf: &mut [u8],
        delay: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.rpcx_core(dst, payload, reply_buf, Wait::Until(t))
    }

    fn rpcx_core(
        &self,
        dst: TaskId,
        payload: &[u8],
        reply_buf: &mut [u8],
        wait: Wait,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let me = self.mcb_acquire(payload, reply_buf.len())?;
        let res = self.rpc_core(dst, Carrier::Block, wait);
        let out = match res {
            Ok((partner, _)) => {
                let g = self.lock();
                let reply = &g.tasks[me as usize].mcb.reply;
                let n = reply.len().min(reply_buf.len());
                reply_buf[..n].copy_from_slice(&reply[..n]);
                Ok((partner, n))
            }
            Err(e) => Err(e),
        };
        self.mcb_release(me);
        out
    }

    /// Extended receive into `buf`; returns the sender and the number of
    /// bytes delivered.
    pub fn receivex(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
    ) -> Result<(TaskId, usize), MsgError> {
        self.receivex_core(src, buf, Wait::Forever).map_err(strip_timeout)
    }

    pub fn receivex_if(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
    ) -> Result<(TaskId, usize), TryMsgError> {
        self.receivex_core(src, buf, Wait::NoWait)
            .map_err(timeout_to_wouldblock)
    }

    pub fn receivex_until(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
        time: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        self.receivex_core(src, buf, Wait::Until(time))
    }

    pub fn receivex_timed(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
        delay: Count,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let t = self.get_time() + delay;
        self.receivex_core(src, buf, Wait::Until(t))
    }

    fn receivex_core(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
        wait: Wait,
    ) -> Result<(TaskId, usize), MsgTimeoutError> {
        let me = self.mcb_acquire(&[], buf.len())?;
        let res = self.receive_core(src, wait, Some(buf));
        let out = match res {
            Ok((partner, _, n)) => Ok((partner, n)),
            Err(e) => Err(e),
        };
        self.mcb_release(me);
        out
    }

    /// Extended reply to an RPC caller.
    pub fn returnx(&self, caller: TaskId, payload: &[u8]) -> Result<TaskId, MsgError> {
        self.return_core(caller, Carrier::Block, payload)
    }

    /// Extended peek: copy the pending payload without consuming it.
    pub fn evdrpx(
        &self,
        src: Option<TaskId>,
        buf: &mut [u8],
    ) -> Result<(TaskId, usize), TryMsgError> {
        let g = self.lock();
        let me = self.current_task_idx(&g).ok_or(TryMsgError::NotPermitted)?;
        let s = self
            .find_sender(&g, me, src)?
            .ok_or(TryMsgError::WouldBlock)?;
        let t = &g.tasks[s as usize];
        let n = t.mcb.sbuf.len().min(buf.len());
        buf[..n].copy_from_slice(&t.mcb.sbuf[..n]);
        Ok((t.id(s), n))
    }

    // -----------------------------------------------------------------
    // Cores

    fn send_core(&self, dst: TaskId, msg: Carrier, wait: Wait) -> Result<TaskId, MsgTimeoutError> {
        let mut plan = Plan::new();
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(MsgTimeoutError::NotPermitted)?;
        let d = g.resolve(dst).ok_or(MsgTimeoutError::BadTask)?;

        if self.ready_to_receive(&g, d, me) {
            g.tasks[me as usize].msg = msg;
            self.deliver(&mut g, me, d);
            self.accept_delivery(&mut g, d, me, &mut plan);
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
            drop(g);
            if self.run_plan(plan) {
                self.switched_in();
            }
            return Ok(dst);
        }

        match wait {
            Wait::NoWait => Err(MsgTimeoutError::Timeout),
            Wait::Until(t) if t <= g.rt_time_h => Err(MsgTimeoutError::Timeout),
            Wait::Forever | Wait::Until(_) => {
                g.tasks[me as usize].msg = msg;
                g.tasks[me as usize].state.insert(TaskState::SEND);
                g.tasks[me as usize].blocked_on = Some(Blocker::MsgQueue(d));
                g.tasks[me as usize].wait_res = WaitRes::Pending;
                let order = g.msg_order;
                {
                    let mut head = std::mem::take(&mut g.tasks[d as usize].msgq);
                    wait_enq(&mut g.tasks, &mut head, me, order);
                    g.tasks[d as usize].msgq = head;
                }
                let until = match wait {
                    Wait::Until(t) => Some(t),
                    _ => None,
                };
                match self.block_current_with(g, me, until, plan) {
                    WaitRes::Ok(Some(p)) => Ok(p),
                    WaitRes::Ok(None) => Ok(dst),
                    WaitRes::Timeout => Err(MsgTimeoutError::Timeout),
                    _ => Err(MsgTimeoutError::Unblocked),
                }
            }
        }
    }

    fn rpc_core(
        &self,
        dst: TaskId,
        msg: Carrier,
        wait: Wait,
    ) -> Result<(TaskId, Carrier), MsgTimeoutError> {
        let mut plan = Plan::new();
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(MsgTimeoutError::NotPermitted)?;
        let d = g.resolve(dst).ok_or(MsgTimeoutError::BadTask)?;

        let until = match wait {
            Wait::Until(t) => Some(t),
            _ => None,
        };

        if self.ready_to_receive(&g, d, me) {
            // The server gets the request now; we park straight on its
            // return queue, lending it our priority while it works.
            g.tasks[me as usize].msg = msg;
            self.deliver(&mut g, me, d);
            self.accept_delivery(&mut g, d, me, &mut plan);
            g.tasks[me as usize].state.insert(TaskState::RETURN);
            g.tasks[me as usize].blocked_on = Some(Blocker::RetQueue(d));
            g.tasks[me as usize].wait_res = WaitRes::Pending;
            let order = g.msg_order;
            {
                let mut head = std::mem::take(&mut g.tasks[d as usize].retq);
                wait_enq(&mut g.tasks, &mut head, me, order);
                g.tasks[d as usize].retq = head;
            }
            g.tasks[d as usize].owndres += RPC_UNIT;
            self.pass_prio(&mut g, d, me);
            return self.finish_rpc_wait(g, me, dst, until, plan);
        }

        match wait {
            Wait::NoWait => Err(MsgTimeoutError::Timeout),
            Wait::Until(t) if t <= g.rt_time_h => Err(MsgTimeoutError::Timeout),
            Wait::Forever | Wait::Until(_) => {
                g.tasks[me as usize].msg = msg;
                g.tasks[me as usize].state.insert(TaskState::RPC);
                g.tasks[me as usize].blocked_on = Some(Blocker::MsgQueue(d));
                g.tasks[me as usize].wait_res = WaitRes::Pending;
                let order = g.msg_order;
                {
                    let mut head = std::mem::take(&mut g.tasks[d as usize].msgq);
                    wait_enq(&mut g.tasks, &mut head, me, order);
                    g.tasks[d as usize].msgq = head;
                }
                self.pass_prio(&mut g, d, me);
                self.finish_rpc_wait(g, me, dst, until, plan)
            }
        }
    }

    /// Park for the rpc reply and decode the outcome.
    fn finish_rpc_wait(
        &self,
        g: spin::MutexGuard<'_, SchedState>,
        me: u32,
        dst: TaskId,
        until: Option<Count>,
        plan: Plan,
    ) -> Result<(TaskId, Carrier), MsgTimeoutError> {
        match self.block_current_with(g, me, until, plan) {
            WaitRes::Ok(_) => {
                let g = self.lock();
                Ok((dst, g.tasks[me as usize].msg))
            }
            WaitRes::Timeout => Err(MsgTimeoutError::Timeout),
            _ => Err(MsgTimeoutError::Unblocked),
        }
    }

    fn receive_core(
        &self,
        src: Option<TaskId>,
        wait: Wait,
        mut buf: Option<&mut [u8]>,
    ) -> Result<(TaskId, Carrier, usize), MsgTimeoutError> {
        let mut plan = Plan::new();
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(MsgTimeoutError::NotPermitted)?;
        let want = match src {
            Some(id) => Some(g.resolve(id).ok_or(MsgTimeoutError::BadTask)?),
            None => None,
        };

        let found = self
            .find_sender(&g, me, src)
            .map_err(|_| MsgTimeoutError::BadTask)?;
        if let Some(s) = found {
            // Take the message straight out of the parked sender.
            {
                let mut head = std::mem::take(&mut g.tasks[me as usize].msgq);
                wait_rem(&mut g.tasks, &mut head, s);
                g.tasks[me as usize].msgq = head;
            }
            let state = &mut *g;
            timed_rem(&mut state.tasks, &mut state.timed, s);
            let msg = g.tasks[s as usize].msg;
            let n = if let Some(buf) = buf.as_deref_mut() {
                let sbuf = &g.tasks[s as usize].mcb.sbuf;
                let n = sbuf.len().min(buf.len());
                buf[..n].copy_from_slice(&sbuf[..n]);
                n
            } else {
                0
            };
            if g.tasks[s as usize].state.contains(TaskState::SEND) {
                let me_id = g.tasks[me as usize].id(me);
                let t = &mut g.tasks[s as usize];
                t.state.remove(TaskState::SEND | TaskState::DELAYED);
                t.blocked_on = None;
                t.wait_res = WaitRes::Ok(Some(me_id));
                self.make_ready(&mut g, s, &mut plan);
            } else if g.tasks[s as usize].state.contains(TaskState::RPC) {
                // The caller now waits for our reply.
                let t = &mut g.tasks[s as usize];
                t.state.remove(TaskState::RPC | TaskState::DELAYED);
                t.state.insert(TaskState::RETURN);
                t.blocked_on = Some(Blocker::RetQueue(me));
                let order = g.msg_order;
                {
                    let mut head = std::mem::take(&mut g.tasks[me as usize].retq);
                    wait_enq(&mut g.tasks, &mut head, s, order);
                    g.tasks[me as usize].retq = head;
                }
                g.tasks[me as usize].owndres += RPC_UNIT;
            }
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
            let sender_id = g.tasks[s as usize].id(s);
            drop(g);
            if self.run_plan(plan) {
                self.switched_in();
            }
            self.proxy_autoreply(sender_id);
            return Ok((sender_id, msg, n));
        }

        match wait {
            Wait::NoWait => Err(MsgTimeoutError::Timeout),
            Wait::Until(t) if t <= g.rt_time_h => Err(MsgTimeoutError::Timeout),
            Wait::Forever | Wait::Until(_) => {
                g.tasks[me as usize].state.insert(TaskState::RECEIVE);
                g.tasks[me as usize].blocked_on = Some(Blocker::Receive(want));
                g.tasks[me as usize].wait_res = WaitRes::Pending;
                let until = match wait {
                    Wait::Until(t) => Some(t),
                    _ => None,
                };
                match self.block_current_with(g, me, until, plan) {
                    WaitRes::Ok(Some(p)) => {
                        let (msg, n) = {
                            let mut g = self.lock();
                            let msg = g.tasks[me as usize].msg;
                            let n = if let Some(buf) = buf.as_deref_mut() {
                                let reply = std::mem::take(&mut g.tasks[me as usize].mcb.reply);
                                let n = reply.len().min(buf.len());
                                buf[..n].copy_from_slice(&reply[..n]);
                                n
                            } else {
                                0
                            };
                            (msg, n)
                        };
                        self.proxy_autoreply(p);
                        Ok((p, msg, n))
                    }
                    WaitRes::Timeout => Err(MsgTimeoutError::Timeout),
                    _ => Err(MsgTimeoutError::Unblocked),
                }
            }
        }
    }

    fn return_core(
        &self,
        caller: TaskId,
        reply: Carrier,
        payload: &[u8],
    ) -> Result<TaskId, MsgError> {
        let mut plan = Plan::new();
        {
            let mut g = self.lock();
            let me = self.current_task_idx(&g).ok_or(MsgError::NotPermitted)?;
            let c = g.resolve(caller).ok_or(MsgError::BadTask)?;
            if !g.tasks[c as usize].state.contains(TaskState::RETURN)
                || g.tasks[c as usize].blocked_on != Some(Blocker::RetQueue(me))
            {
                // The caller is gone (killed or timed out); the reply is
                // silently discarded.
                return Err(MsgError::Unblocked);
            }
            {
                let mut head = std::mem::take(&mut g.tasks[me as usize].retq);
                wait_rem(&mut g.tasks, &mut head, c);
                g.tasks[me as usize].retq = head;
            }
            if g.tasks[me as usize].pending_rpcs() > 0 {
                g.tasks[me as usize].owndres -= RPC_UNIT;
            }
            self.restore_inherited(&mut g, me);
            self.check_deferred_delete(&mut g, me, &mut plan);

            g.tasks[c as usize].msg = reply;
            if reply == Carrier::Block {
                let n = payload.len().min(g.tasks[c as usize].mcb.rcap);
                g.tasks[c as usize].mcb.reply = payload[..n].to_vec();
            }
            let state = &mut *g;
            timed_rem(&mut state.tasks, &mut state.timed, c);
            let me_id = g.tasks[me as usize].id(me);
            let t = &mut g.tasks[c as usize];
            t.state.remove(TaskState::RETURN | TaskState::DELAYED);
            t.blocked_on = None;
            t.wait_res = WaitRes::Ok(Some(me_id));
            self.make_ready(&mut g, c, &mut plan);
            let cpu = self.pipeline.current_cpu();
            self.schedule_locked(&mut g, cpu, &mut plan);
        }
        if self.run_plan(plan) {
            self.switched_in();
        }
        Ok(caller)
    }

    // -----------------------------------------------------------------
    // Plumbing

    /// Is `d` waiting in receive for us (or for anyone)?
    fn ready_to_receive(&self, g: &SchedState, d: u32, me: u32) -> bool {
        if !g.tasks[d as usize].state.contains(TaskState::RECEIVE) {
            return false;
        }
        match g.tasks[d as usize].blocked_on {
            Some(Blocker::Receive(None)) => true,
            Some(Blocker::Receive(Some(want))) => want == me,
            _ => false,
        }
    }

    /// Deliver the pending carrier of `from` into `to` (a receiver in
    /// RECEIVE). Extended payloads land in the receiver's control block.
    fn deliver(&self, g: &mut SchedState, from: u32, to: u32) {
        let msg = g.tasks[from as usize].msg;
        g.tasks[to as usize].msg = msg;
        if msg == Carrier::Block {
            let sbuf = g.tasks[from as usize].mcb.sbuf.clone();
            let n = sbuf.len().min(g.tasks[to as usize].mcb.rcap);
            g.tasks[to as usize].mcb.reply = sbuf[..n].to_vec();
        }
    }

    /// Complete a fast-path delivery: wake the receiver with us as the
    /// recorded partner.
    fn accept_delivery(&self, g: &mut SchedState, d: u32, me: u32, plan: &mut Plan) {
        timed_rem(&mut g.tasks, &mut g.timed, d);
        let me_id = g.tasks[me as usize].id(me);
        let t = &mut g.tasks[d as usize];
        t.state.remove(TaskState::RECEIVE | TaskState::DELAYED);
        t.blocked_on = None;
        t.wait_res = WaitRes::Ok(Some(me_id));
        self.make_ready(g, d, plan);
    }

    /// Locate a parked sender for `me`: the designated one, or the head
    /// of the inbound queue.
    fn find_sender(
        &self,
        g: &SchedState,
        me: u32,
        src: Option<TaskId>,
    ) -> Result<Option<u32>, TryMsgError> {
        match src {
            Some(id) => {
                let s = g.resolve(id).ok_or(TryMsgError::BadTask)?;
                let t = &g.tasks[s as usize];
                let blocked_on_me = t.blocked_on == Some(Blocker::MsgQueue(me));
                Ok((t.state.intersects(TaskState::SEND | TaskState::RPC) && blocked_on_me)
                    .then_some(s))
            }
            None => Ok(g.tasks[me as usize].msgq.first),
        }
    }

    /// A proxy never waits for its reply: if the sender we just received
    /// from is a proxy aimed at us, answer it on the spot.
    fn proxy_autoreply(&self, sender: TaskId) {
        let is_mine = {
            let g = self.lock();
            let me = self.current_task_idx(&g);
            match (g.tcb(sender), me) {
                (Some(t), Some(me)) => t
                    .proxy
                    .as_ref()
                    .map_or(false, |p| g.resolve(p.receiver) == Some(me)),
                _ => false,
            }
        };
        if is_mine {
            let _ = self.msg_return(sender, 0);
        }
    }

    /// Claim the caller's message control block for one blocking call.
    fn mcb_acquire(&self, sbuf: &[u8], rcap: usize) -> Result<u32, MsgTimeoutError> {
        let mut g = self.lock();
        let me = self
            .current_task_idx(&g)
            .ok_or(MsgTimeoutError::NotPermitted)?;
        let mcb = &mut g.tasks[me as usize].mcb;
        if mcb.busy {
            // One outstanding blocking call per task; a signal function
            // sneaking in a nested extended transfer is refused.
            return Err(MsgTimeoutError::NotPermitted);
        }
        mcb.busy = true;
        mcb.sbuf = sbuf.to_vec();
        mcb.rcap = rcap;
        mcb.reply = Vec::new();
        Ok(me)
    }

    fn mcb_release(&self, me: u32) {
        let mut g = self.lock();
        if let Some(t) = g.tasks.get_mut(me as usize) {
            t.mcb.busy = false;
            t.mcb.sbuf = Vec::new();
            t.mcb.reply = Vec::new();
            t.mcb.rcap = 0;
        }
    }
}

#[inline]
fn word_of(c: Carrier) -> usize {
    match c {
        Carrier::Word(w) => w,
        // A scalar receive of an extended transfer yields zero; the
        // payload only travels through the extended variants.
        Carrier::Block => 0,
    }
}

#[inline]
fn strip_timeout(e: MsgTimeoutError) -> MsgError {
    match e {
        MsgTimeoutError::BadTask => MsgError::BadTask,
        MsgTimeoutError::Unblocked => MsgError::Unblocked,
        MsgTimeoutError::NotPermitted => MsgError::NotPermitted,
        MsgTimeoutError::Timeout => unreachable!("untimed messaging call timed out"),
    }
}

#[inline]
fn timeout_to_wouldblock(e: MsgTimeoutError) -> TryMsgError {
    match e {
        MsgTimeoutError::BadTask => TryMsgError::BadTask,
        MsgTimeoutError::Unblocked | MsgTimeoutError::Timeout => TryMsgError::WouldBlock,
        MsgTimeoutError::NotPermitted => TryMsgError::NotPermitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MsgError, TryMsgError};
    use crate::task::TaskOptions;
    use crate::testutil::{mock_exec, with_task_context};

    #[test]
    fn send_if_without_receiver_would_block() {
        let exec = mock_exec(1);
        let peer = exec
            .task_init(6, TaskOptions::default(), |_, _| {})
            .unwrap();
        with_task_context(&exec, |exec| {
            assert_eq!(exec.send_if(peer, 1), Err(TryMsgError::WouldBlock));
            assert_eq!(exec.receive_if(Some(peer)), Err(TryMsgError::WouldBlock));
            assert_eq!(exec.evdrp(None), Err(TryMsgError::WouldBlock));
        });
    }

    #[test]
    fn stale_handle_is_bad_task() {
        let exec = mock_exec(1);
        let peer = exec
            .task_init(6, TaskOptions::default(), |_, _| {})
            .unwrap();
        exec.task_delete(peer).unwrap();
        with_task_context(&exec, |exec| {
            assert_eq!(exec.send_if(peer, 1), Err(TryMsgError::BadTask));
            assert_eq!(exec.msg_return(peer, 0), Err(MsgError::BadTask));
        });
    }

    #[test]
    fn return_without_pending_rpc_is_discarded() {
        let exec = mock_exec(1);
        let peer = exec
            .task_init(6, TaskOptions::default(), |_, _| {})
            .unwrap();
        with_task_context(&exec, |exec| {
            assert_eq!(exec.msg_return(peer, 7), Err(MsgError::Unblocked));
        });
    }

    #[test]
    fn messaging_requires_a_task_context() {
        let exec = mock_exec(1);
        let peer = exec
            .task_init(6, TaskOptions::default(), |_, _| {})
            .unwrap();
        assert_eq!(exec.send_if(peer, 1), Err(TryMsgError::NotPermitted));
        assert_eq!(exec.evdrp(None), Err(TryMsgError::NotPermitted));
    }
}
