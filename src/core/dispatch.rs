//! Filter chain plus forward/include execution.
//!
//! One `RequestDispatcher` is both the chain handed to filters and the thing that finally runs the
//! target. Its role (forward or include) is fixed by the first call into it; every later entry,
//! including the one made when the last filter continues the chain, follows that role.

use std::io;
use std::sync::Arc;

use crate::core::context::AppContext;
use crate::core::error::HandlerError;
use crate::core::http::{ErrorAttributes, PathAttributes, Request, Response};
use crate::core::registry::{FilterRegistration, HandlerRegistration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchType {
    Request,
    Forward,
    Include,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unset,
    Include,
    Forward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    NotStarted,
    FilterChainRunning,
    TargetExecuting,
    Done,
}

/// What filter mappings are matched against: the path for URL dispatches, the handler name for
/// named ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FilterKey {
    Path(String),
    Name(String),
}

pub struct RequestDispatcher {
    target: Arc<HandlerRegistration>,
    kind: Option<DispatchType>,
    key: FilterKey,

    // path within the context; `None` for named dispatches
    request_uri: Option<String>,
    servlet_path: String,
    path_info: Option<String>,
    query_string: Option<String>,
    error: Option<ErrorAttributes>,

    filters: Option<Arc<Vec<Arc<FilterRegistration>>>>,
    cursor: usize,
    role: Role,
    state: DispatchState,
}

impl RequestDispatcher {
    /// A dispatcher without a fixed kind becomes a forward or an include depending on how it is
    /// first entered.
    pub(crate) fn named(target: Arc<HandlerRegistration>, kind: Option<DispatchType>) -> Self {
        RequestDispatcher {
            key: FilterKey::Name(target.name().to_owned()),
            target,
            kind,
            request_uri: None,
            servlet_path: String::new(),
            path_info: None,
            query_string: None,
            error: None,
            filters: None,
            cursor: 0,
            role: Role::Unset,
            state: DispatchState::NotStarted,
        }
    }

    pub(crate) fn with_path(
        mut self,
        request_uri: &str,
        servlet_path: &str,
        path_info: Option<&str>,
        query_string: Option<&str>,
    ) -> Self {
        self.key = FilterKey::Path(request_uri.to_owned());
        self.request_uri = Some(request_uri.to_owned());
        self.servlet_path = servlet_path.to_owned();
        self.path_info = path_info.map(str::to_owned);
        self.query_string = query_string.map(str::to_owned);
        self
    }

    pub(crate) fn with_error(mut self, error: ErrorAttributes) -> Self {
        self.error = Some(error);
        self
    }

    /// Status and message of an error dispatch that has not started yet.
    pub(crate) fn pending_error(&self) -> Option<(u16, String)> {
        self.error
            .as_ref()
            .map(|error| (error.status, error.message.clone()))
    }

    /// `None` until the first forward or include fixes it.
    #[inline]
    pub fn dispatch_type(&self) -> Option<DispatchType> {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> DispatchState {
        self.state
    }

    #[inline]
    pub fn target_name(&self) -> &str {
        self.target.name()
    }

    /// Filters selected for this dispatch, empty before it starts.
    pub fn filter_names(&self) -> Vec<&str> {
        self.filters
            .iter()
            .flat_map(|filters| filters.iter().map(|filter| filter.name()))
            .collect()
    }

    fn enter(&mut self, ctx: &AppContext, role: Role, fallback: DispatchType) -> DispatchType {
        let kind = *self.kind.get_or_insert(fallback);
        self.role = role;
        self.filters = Some(ctx.matching_filters(kind, &self.key, self.target.name()));
        kind
    }

    /// Hand the whole response over to the target. Buffered output is discarded first, and the
    /// response is finished once the target returns.
    pub fn forward(
        &mut self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        if self.role != Role::Unset {
            return self.do_filter(ctx, req, resp);
        }

        let kind = self.enter(ctx, Role::Forward, DispatchType::Forward);

        if resp.is_committed() {
            return Err(HandlerError::IllegalState(
                "cannot forward after the response has been committed".to_owned(),
            ));
        }

        resp.reset_buffer()?;
        resp.clear_include_stack();
        req.clear_include_stack();

        if let Some(error) = self.error.take() {
            resp.clear_content_length();
            resp.set_status(error.status);
            req.set_error_attributes(error);
        }

        match (kind, self.request_uri.as_deref()) {
            (_, None) => {}
            (DispatchType::Request, Some(_)) => {
                req.set_paths(&self.servlet_path, self.path_info.as_deref());
            }
            (_, Some(uri)) => {
                req.capture_forward_attributes();
                req.apply_forward(
                    uri,
                    &self.servlet_path,
                    self.path_info.as_deref(),
                    self.query_string.as_deref(),
                );
            }
        }

        if kind == DispatchType::Request {
            if let Some(auth) = ctx.authenticator() {
                let path = req.full_path();
                if !auth.check_access(req, resp, &path)? {
                    self.state = DispatchState::Done;
                    return Ok(());
                }
            }
        }

        self.do_filter(ctx, req, resp)?;

        if kind != DispatchType::Request {
            resp.finish()?;
        }

        Ok(())
    }

    /// Run the target into a nested buffer that lands in the enclosing output when the include
    /// returns, whether it succeeded or not.
    pub fn include(
        &mut self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        if self.role != Role::Unset {
            return self.do_filter(ctx, req, resp);
        }

        self.kind = Some(DispatchType::Include);
        self.enter(ctx, Role::Include, DispatchType::Include);

        let attributes = self.request_uri.as_deref().map(|uri| PathAttributes {
            request_uri: [req.context_path(), uri].concat(),
            context_path: req.context_path().to_owned(),
            servlet_path: self.servlet_path.clone(),
            path_info: self.path_info.clone(),
            query_string: self.query_string.clone(),
        });

        let mut scope = IncludeScope::enter(req, resp, self.query_string.as_deref(), attributes);
        let result = self.do_filter(ctx, scope.req, scope.resp);
        let unwound = scope.exit();

        result?;
        unwound.map_err(HandlerError::from)
    }

    /// Continue the chain: the next filter if there is one, otherwise the target.
    pub fn do_filter(
        &mut self,
        ctx: &AppContext,
        req: &mut Request,
        resp: &mut Response,
    ) -> Result<(), HandlerError> {
        let next = self
            .filters
            .as_ref()
            .and_then(|filters| filters.get(self.cursor))
            .cloned();

        if let Some(filter) = next {
            self.cursor += 1;
            self.state = DispatchState::FilterChainRunning;
            return filter.execute(ctx, req, resp, self);
        }

        self.state = DispatchState::TargetExecuting;
        let result = self.target.execute(ctx, req, resp);
        self.state = DispatchState::Done;
        result
    }
}

/// Pushes the request's include frame and the response's include buffer, and pops both when
/// dropped, so an early return or a panic still unwinds them.
struct IncludeScope<'r> {
    req: &'r mut Request,
    resp: &'r mut Response,
    open: bool,
}

impl<'r> IncludeScope<'r> {
    fn enter(
        req: &'r mut Request,
        resp: &'r mut Response,
        query_string: Option<&str>,
        attributes: Option<PathAttributes>,
    ) -> Self {
        req.push_include(query_string, attributes);
        resp.start_include_buffer();

        IncludeScope {
            req,
            resp,
            open: true,
        }
    }

    fn exit(mut self) -> io::Result<()> {
        self.open = false;
        self.req.pop_include();
        self.resp.finish_include_buffer()
    }
}

impl<'r> Drop for IncludeScope<'r> {
    fn drop(&mut self) {
        if self.open {
            self.req.pop_include();
            let _ = self.resp.finish_include_buffer();
        }
    }
}
