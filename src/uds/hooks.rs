//! T_Data primitive hooks: an optional observer capability record, not a dispatch table.

/// Observer callbacks fired at the T_Data primitive boundaries of a UDS request. Every field is
/// independently optional; a client registers only the ones it needs.
#[derive(Default)]
pub struct TDataHooks {
    /// Fired immediately before a request is transmitted, with the service byte and payload.
    pub req: Option<Box<dyn Fn(u8, &[u8]) + Send + Sync>>,
    /// Fired once the request/response exchange concludes: `true` on success, or the error.
    pub con: Option<Box<dyn Fn(bool, Option<&str>) + Send + Sync>>,
    /// Fired when the first frame of a multi-frame response is observed.
    pub som_ind: Option<Box<dyn Fn() + Send + Sync>>,
    /// Fired once a response payload has been fully reassembled.
    pub ind: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
}

impl TDataHooks {
    pub(crate) fn fire_req(&self, sid: u8, data: &[u8]) {
        if let Some(f) = &self.req {
            f(sid, data);
        }
    }

    pub(crate) fn fire_con(&self, ok: bool, err: Option<&str>) {
        if let Some(f) = &self.con {
            f(ok, err);
        }
    }

    pub(crate) fn fire_som_ind(&self) {
        if let Some(f) = &self.som_ind {
            f();
        }
    }

    pub(crate) fn fire_ind(&self, payload: &[u8]) {
        if let Some(f) = &self.ind {
            f(payload);
        }
    }
}

impl std::fmt::Debug for TDataHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TDataHooks")
            .field("req", &self.req.is_some())
            .field("con", &self.con.is_some())
            .field("som_ind", &self.som_ind.is_some())
            .field("ind", &self.ind.is_some())
            .finish()
    }
}
